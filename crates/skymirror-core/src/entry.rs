//! The versioned value bound to a key.

use serde::Deserialize;
use serde::Serialize;

/// What kind of write produced an [`Entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// A value was stored.
    Put,
    /// The key was deleted; the entry carries no value.
    Delete,
}

/// One value bound to one key at a point in time.
///
/// Entries are immutable once produced: a new write yields a new entry with
/// a higher revision rather than mutating the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Bucket that produced this entry.
    pub bucket: String,
    /// Key this entry is bound to.
    pub key: String,
    /// Opaque application payload. Empty for deletes.
    pub value: Vec<u8>,
    /// Per-bucket sequence number assigned by the producing bucket.
    pub revision: u64,
    /// Write time in milliseconds since the Unix epoch.
    pub created_ms: u64,
    /// Operation that produced the entry.
    pub operation: Operation,
}

impl Entry {
    /// Whether the entry is a delete marker.
    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }

    /// Payload as UTF-8, if it is valid UTF-8.
    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(operation: Operation, value: &[u8]) -> Entry {
        Entry {
            bucket: "flights".to_string(),
            key: "users.7.flights.owned.NZ500".to_string(),
            value: value.to_vec(),
            revision: 3,
            created_ms: 1,
            operation,
        }
    }

    #[test]
    fn delete_marker_is_delete() {
        assert!(entry(Operation::Delete, b"").is_delete());
        assert!(!entry(Operation::Put, b"x").is_delete());
    }

    #[test]
    fn value_str_rejects_invalid_utf8() {
        assert_eq!(entry(Operation::Put, b"on time").value_str(), Some("on time"));
        assert_eq!(entry(Operation::Put, &[0xff, 0xfe]).value_str(), None);
    }
}
