//! Error type shared by every bucket implementation.

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

/// Errors returned by a [`KvBucket`](crate::KvBucket).
///
/// Serializable so the remote server can hand the exact error back to the
/// client over the wire.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KvError {
    #[error("key '{key}' not found")]
    NotFound { key: String },
    #[error("key cannot be empty")]
    EmptyKey,
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("key size {size} exceeds maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: u32 },
    #[error("value size {size} exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: u32 },
    #[error("bucket '{bucket}' is full ({max} keys)")]
    BucketFull { bucket: String, max: usize },
    #[error("bucket '{bucket}' not found")]
    BucketNotFound { bucket: String },
    #[error("connection closed")]
    Closed,
    #[error("operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("unauthorized: {reason}")]
    Unauthorized { reason: String },
    #[error("operation failed: {reason}")]
    Failed { reason: String },
}

impl KvError {
    /// Build a generic failure from anything displayable.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        KvError::Failed {
            reason: reason.to_string(),
        }
    }

    /// Whether the error means the transport is gone rather than the request being bad.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, KvError::Closed | KvError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kv_error_not_found_display() {
        let err = KvError::NotFound {
            key: "flights.NZ500".to_string(),
        };
        assert_eq!(err.to_string(), "key 'flights.NZ500' not found");
    }

    #[test]
    fn kv_error_bucket_full_display() {
        let err = KvError::BucketFull {
            bucket: "inMemoryFlights".to_string(),
            max: 10,
        };
        assert_eq!(err.to_string(), "bucket 'inMemoryFlights' is full (10 keys)");
    }

    #[test]
    fn kv_error_key_too_large_display() {
        let err = KvError::KeyTooLarge { size: 2048, max: 1024 };
        assert_eq!(err.to_string(), "key size 2048 exceeds maximum of 1024 bytes");
    }

    #[test]
    fn kv_error_connection_errors() {
        assert!(KvError::Closed.is_connection_error());
        assert!(KvError::Timeout { duration_ms: 5 }.is_connection_error());
        assert!(!KvError::EmptyKey.is_connection_error());
    }

    #[test]
    fn kv_error_survives_wire_encoding() {
        let err = KvError::Unauthorized {
            reason: "bad token".to_string(),
        };
        let bytes = postcard::to_allocvec(&err).unwrap();
        let decoded: KvError = postcard::from_bytes(&bytes).unwrap();
        assert_eq!(err, decoded);
    }
}
