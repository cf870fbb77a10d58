use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use parking_lot::RwLock;
use skymirror_core::Entry;
use skymirror_core::KeyWatcher;
use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::Operation;
use skymirror_core::WatchOptions;
use skymirror_core::WatchSender;
use skymirror_core::constants::BUCKET_BROADCAST_BUFFER;
use skymirror_core::constants::KEY_WATCH_BUFFER;
use skymirror_core::constants::MAX_KEYS_PER_BUCKET;
use skymirror_core::constants::MAX_LIST_KEYS;
use skymirror_core::current_time_ms;
use skymirror_core::pattern;
use skymirror_core::validate_key;
use skymirror_core::validate_pattern;
use skymirror_core::validate_value;
use skymirror_core::watch_channel;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;
use tracing::warn;

/// A named, memory-resident bucket.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct MemoryBucket {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    max_keys: usize,
    state: RwLock<State>,
    updates: broadcast::Sender<Entry>,
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.inner.name)
            .field("max_keys", &self.inner.max_keys)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct State {
    /// Latest entry per key, delete markers included.
    entries: BTreeMap<String, Entry>,
    /// Entries that are not delete markers; bounded by `max_keys`.
    live: usize,
    revision: u64,
}

impl MemoryBucket {
    /// Create an empty bucket with the default bounds.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_limits(name, MAX_KEYS_PER_BUCKET, BUCKET_BROADCAST_BUFFER)
    }

    /// Create an empty bucket with explicit key and broadcast bounds.
    pub fn with_limits(name: impl Into<String>, max_keys: usize, broadcast_buffer: usize) -> Self {
        let (updates, _) = broadcast::channel(broadcast_buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                max_keys,
                state: RwLock::new(State::default()),
                updates,
            }),
        }
    }

    /// Number of live (non-deleted) keys.
    pub fn len(&self) -> usize {
        self.inner.state.read().live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revision of the most recent write, 0 for a fresh bucket.
    pub fn revision(&self) -> u64 {
        self.inner.state.read().revision
    }

    fn write(&self, key: &str, value: Vec<u8>, operation: Operation) -> Result<u64, KvError> {
        let inner = &self.inner;
        let mut state = inner.state.write();

        let was_live = state.entries.get(key).is_some_and(|entry| !entry.is_delete());
        let is_live = operation == Operation::Put;
        if is_live && !was_live && state.live >= inner.max_keys {
            return Err(KvError::BucketFull {
                bucket: inner.name.clone(),
                max: inner.max_keys,
            });
        }

        state.revision += 1;
        let entry = Entry {
            bucket: inner.name.clone(),
            key: key.to_string(),
            value,
            revision: state.revision,
            created_ms: current_time_ms(),
            operation,
        };
        state.entries.insert(key.to_string(), entry.clone());
        match (was_live, is_live) {
            (false, true) => state.live += 1,
            (true, false) => state.live -= 1,
            _ => {}
        }

        // Sent under the write lock; an error only means nobody is watching.
        let _ = inner.updates.send(entry);
        Ok(state.revision)
    }
}

impl Inner {
    fn snapshot(&self, pattern: &str, options: WatchOptions) -> Vec<Entry> {
        let state = self.state.read();
        collect_matching(&state, pattern, options)
    }
}

fn collect_matching(state: &State, filter: &str, options: WatchOptions) -> Vec<Entry> {
    state
        .entries
        .values()
        .filter(|entry| pattern::matches(filter, &entry.key) && options.admits(entry))
        .cloned()
        .collect()
}

#[async_trait]
impl KvBucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn get(&self, key: &str) -> Result<Option<Entry>, KvError> {
        validate_key(key)?;
        let state = self.inner.state.read();
        Ok(state.entries.get(key).filter(|entry| !entry.is_delete()).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, KvError> {
        validate_key(key)?;
        validate_value(&value)?;
        self.write(key, value, Operation::Put)
    }

    async fn delete(&self, key: &str) -> Result<u64, KvError> {
        validate_key(key)?;
        self.write(key, Vec::new(), Operation::Delete)
    }

    async fn keys(&self, filter: &str) -> Result<Vec<String>, KvError> {
        validate_pattern(filter)?;
        let state = self.inner.state.read();
        Ok(state
            .entries
            .values()
            .filter(|entry| !entry.is_delete() && pattern::matches(filter, &entry.key))
            .take(MAX_LIST_KEYS)
            .map(|entry| entry.key.clone())
            .collect())
    }

    async fn watch(&self, pattern: &str, options: WatchOptions) -> Result<KeyWatcher, KvError> {
        validate_pattern(pattern)?;
        let (sender, watcher) = watch_channel(pattern, KEY_WATCH_BUFFER);

        let (initial, updates) = {
            let state = self.inner.state.read();
            let updates = self.inner.updates.subscribe();
            let initial = if options.updates_only {
                Vec::new()
            } else {
                collect_matching(&state, pattern, options)
            };
            (initial, updates)
        };

        debug!(bucket = %self.inner.name, pattern, initial = initial.len(), "watch opened");
        tokio::spawn(run_watch(
            Arc::downgrade(&self.inner),
            pattern.to_string(),
            options,
            initial,
            updates,
            sender,
        ));
        Ok(watcher)
    }
}

/// Forward matching bucket updates into one watcher until it stops or the bucket is dropped.
async fn run_watch(
    bucket: Weak<Inner>,
    pattern: String,
    options: WatchOptions,
    initial: Vec<Entry>,
    mut updates: broadcast::Receiver<Entry>,
    sender: WatchSender,
) {
    for entry in initial {
        if !sender.send(entry).await {
            return;
        }
    }

    loop {
        let received = tokio::select! {
            _ = sender.stopped() => return,
            received = updates.recv() => received,
        };

        match received {
            Ok(entry) => {
                if pattern::matches(&pattern, &entry.key) && options.admits(&entry) && !sender.send(entry).await {
                    return;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                let Some(inner) = bucket.upgrade() else {
                    return;
                };
                warn!(
                    bucket = %inner.name,
                    %pattern,
                    skipped,
                    "watch lagged behind bucket writes, resending current values"
                );
                let current = inner.snapshot(&pattern, options);
                drop(inner);
                for entry in current {
                    if !sender.send(entry).await {
                        return;
                    }
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use super::*;

    const WAIT: Duration = Duration::from_secs(2);

    async fn next(watcher: &mut KeyWatcher) -> Entry {
        tokio::time::timeout(WAIT, watcher.recv()).await.expect("timed out waiting for entry").expect("watch ended")
    }

    #[tokio::test]
    async fn put_get_delete() {
        let bucket = MemoryBucket::new("inMemoryFlights");
        let r1 = bucket.put("flights.NZ500", b"boarding".to_vec()).await.unwrap();
        let r2 = bucket.put("flights.NZ500", b"departed".to_vec()).await.unwrap();
        assert!(r2 > r1);

        let entry = bucket.get("flights.NZ500").await.unwrap().unwrap();
        assert_eq!(entry.value, b"departed");
        assert_eq!(entry.revision, r2);
        assert_eq!(entry.bucket, "inMemoryFlights");

        let r3 = bucket.delete("flights.NZ500").await.unwrap();
        assert!(r3 > r2);
        assert!(bucket.get("flights.NZ500").await.unwrap().is_none());
        assert!(bucket.get("flights.QF1").await.unwrap().is_none());
        assert!(bucket.is_empty());
        assert_eq!(bucket.revision(), r3);
    }

    #[tokio::test]
    async fn rejects_invalid_keys() {
        let bucket = MemoryBucket::new("flights");
        assert_eq!(bucket.put("", vec![]).await, Err(KvError::EmptyKey));
        assert!(bucket.put("flights.*", vec![]).await.is_err());
        assert!(bucket.get("flights.>").await.is_err());
    }

    #[tokio::test]
    async fn keys_are_sorted_and_filtered() {
        let bucket = MemoryBucket::new("flights");
        for key in ["users.2.flights.owned.B", "users.1.flights.owned.Z", "users.1.flights.owned.A"] {
            bucket.put(key, b"x".to_vec()).await.unwrap();
        }
        bucket.delete("users.1.flights.owned.Z").await.unwrap();

        let keys = bucket.keys("users.1.flights.owned.>").await.unwrap();
        assert_eq!(keys, vec!["users.1.flights.owned.A".to_string()]);
        assert_eq!(bucket.keys(">").await.unwrap().len(), 2);
        assert_eq!(bucket.len(), 2);
    }

    #[tokio::test]
    async fn bucket_full_rejects_new_keys_only() {
        let bucket = MemoryBucket::with_limits("small", 2, 16);
        bucket.put("a", b"1".to_vec()).await.unwrap();
        bucket.put("b", b"1".to_vec()).await.unwrap();
        assert!(matches!(bucket.put("c", b"1".to_vec()).await, Err(KvError::BucketFull { max: 2, .. })));
        // Overwriting an existing key is still allowed.
        bucket.put("a", b"2".to_vec()).await.unwrap();
    }

    #[tokio::test]
    async fn deleted_keys_free_capacity() {
        let bucket = MemoryBucket::with_limits("small", 2, 16);
        for key in ["a", "b"] {
            bucket.put(key, b"1".to_vec()).await.unwrap();
            bucket.delete(key).await.unwrap();
        }
        assert_eq!(bucket.len(), 0);

        bucket.put("c", b"1".to_vec()).await.unwrap();
        bucket.put("d", b"1".to_vec()).await.unwrap();
        assert_eq!(bucket.len(), 2);
        assert!(matches!(bucket.put("e", b"1".to_vec()).await, Err(KvError::BucketFull { max: 2, .. })));
        // Deletes never hit the cap, and a deleted key can be written again.
        bucket.delete("e").await.unwrap();
        bucket.delete("c").await.unwrap();
        bucket.put("a", b"2".to_vec()).await.unwrap();
        assert_eq!(bucket.len(), 2);
    }

    #[tokio::test]
    async fn watch_delivers_initial_then_live() {
        let bucket = MemoryBucket::new("flights");
        bucket.put("flights.A", b"1".to_vec()).await.unwrap();
        bucket.put("other.A", b"1".to_vec()).await.unwrap();

        let mut watcher = bucket.watch("flights.>", WatchOptions::default()).await.unwrap();
        assert_eq!(next(&mut watcher).await.key, "flights.A");

        bucket.put("flights.B", b"2".to_vec()).await.unwrap();
        bucket.put("other.B", b"2".to_vec()).await.unwrap();
        bucket.delete("flights.A").await.unwrap();

        let live = next(&mut watcher).await;
        assert_eq!((live.key.as_str(), live.value.as_slice()), ("flights.B", b"2".as_slice()));
        let deleted = next(&mut watcher).await;
        assert_eq!(deleted.key, "flights.A");
        assert!(deleted.is_delete());
    }

    #[tokio::test]
    async fn watch_options_are_honoured() {
        let bucket = MemoryBucket::new("flights");
        bucket.put("k", b"old".to_vec()).await.unwrap();

        let mut watcher =
            bucket.watch("k", WatchOptions::ignoring_deletes().with_updates_only()).await.unwrap();
        bucket.delete("k").await.unwrap();
        bucket.put("k", b"new".to_vec()).await.unwrap();

        let entry = next(&mut watcher).await;
        assert_eq!(entry.value, b"new");
        assert!(!entry.is_delete());
    }

    #[tokio::test]
    async fn stopped_watch_releases_task() {
        let bucket = MemoryBucket::new("flights");
        let mut watcher = bucket.watch("k", WatchOptions::default()).await.unwrap();
        watcher.stop();
        bucket.put("k", b"1".to_vec()).await.unwrap();
        assert!(watcher.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropping_bucket_ends_watch() {
        let bucket = MemoryBucket::new("flights");
        let mut watcher = bucket.watch("k", WatchOptions::default()).await.unwrap();
        drop(bucket);
        assert!(tokio::time::timeout(WAIT, watcher.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lagged_watch_resyncs_current_values() {
        let bucket = MemoryBucket::with_limits("flights", 100, 2);
        let mut watcher = bucket.watch("flights.>", WatchOptions::default()).await.unwrap();

        // No await point between writes, so the watch task falls behind the ring.
        for i in 0..10 {
            bucket.put(&format!("flights.F{i}"), b"x".to_vec()).await.unwrap();
        }

        let mut seen = BTreeSet::new();
        while seen.len() < 10 {
            seen.insert(next(&mut watcher).await.key);
        }
        assert_eq!(seen.len(), 10);
    }
}
