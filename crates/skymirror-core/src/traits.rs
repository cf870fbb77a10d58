//! The bucket interface shared by the memory mirror and the remote store.

use async_trait::async_trait;

use crate::entry::Entry;
use crate::error::KvError;
use crate::watch::KeyWatcher;
use crate::watch::WatchOptions;

/// A named key-value bucket with revisions and live watches.
///
/// Implemented by the memory-resident mirror bucket and by the remote client,
/// so callers can treat both storage tiers uniformly.
#[async_trait]
pub trait KvBucket: Send + Sync {
    /// Name of the bucket.
    fn name(&self) -> &str;

    /// Fetch the latest entry for a key.
    ///
    /// Returns `Ok(None)` when the key was never written or its latest
    /// operation is a delete.
    async fn get(&self, key: &str) -> Result<Option<Entry>, KvError>;

    /// Store a value, returning the new revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError>;

    /// Record a delete marker for a key, returning the new revision.
    async fn delete(&self, key: &str) -> Result<u64, KvError>;

    /// List live keys matching a pattern, sorted.
    async fn keys(&self, filter: &str) -> Result<Vec<String>, KvError>;

    /// Open a live watch on every key matching `pattern`.
    async fn watch(&self, pattern: &str, options: WatchOptions) -> Result<KeyWatcher, KvError>;
}

// Blanket implementation for Arc<T>
#[async_trait]
impl<T: KvBucket + ?Sized> KvBucket for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, KvError> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        (**self).delete(key).await
    }

    async fn keys(&self, filter: &str) -> Result<Vec<String>, KvError> {
        (**self).keys(filter).await
    }

    async fn watch(&self, pattern: &str, options: WatchOptions) -> Result<KeyWatcher, KvError> {
        (**self).watch(pattern, options).await
    }
}
