//! Read-through store over the local mirror and the remote authoritative bucket.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use skymirror_core::Entry;
use skymirror_core::KvBucket;
use skymirror_core::KvError;
use tokio::task::JoinSet;
use tracing::debug;

use crate::watch::MergedWatcher;
use crate::watch::WatchError;
use crate::watch::open_merged_watch;

/// One of the two key-value backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// The replicated in-memory mirror.
    Local,
    /// The authoritative remote bucket.
    Remote,
}

impl Tier {
    /// Tiers in the order reads consult them.
    pub const READ_ORDER: [Tier; 2] = [Tier::Local, Tier::Remote];
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::Local => write!(f, "local"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

/// Outcome counts of one batched read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStats {
    /// Distinct keys requested.
    pub requested: usize,
    pub local_hits: usize,
    pub remote_hits: usize,
    /// Keys found in no consulted tier.
    pub misses: usize,
    /// Tier reads that failed with something other than a miss.
    pub errors: usize,
}

impl FetchStats {
    fn record(&mut self, outcome: &KeyOutcome) {
        match outcome.found {
            Some(Tier::Local) => self.local_hits += 1,
            Some(Tier::Remote) => self.remote_hits += 1,
            None => self.misses += 1,
        }
        self.errors += outcome.errors;
    }
}

struct KeyOutcome {
    found: Option<Tier>,
    errors: usize,
}

/// Batched reads and merged watches over both tiers.
///
/// Cloning is cheap; clones share both tier handles.
#[derive(Clone)]
pub struct FlightStore {
    local: Arc<dyn KvBucket>,
    remote: Arc<dyn KvBucket>,
}

impl fmt::Debug for FlightStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightStore")
            .field("local", &self.local.name())
            .field("remote", &self.remote.name())
            .finish()
    }
}

impl FlightStore {
    pub fn new(local: Arc<dyn KvBucket>, remote: Arc<dyn KvBucket>) -> Self {
        Self { local, remote }
    }

    pub fn tier(&self, tier: Tier) -> &Arc<dyn KvBucket> {
        match tier {
            Tier::Local => &self.local,
            Tier::Remote => &self.remote,
        }
    }

    /// Fetch `keys` from the mirror, falling back to the remote bucket per key.
    ///
    /// Keys found in neither tier are omitted. Per-key failures are logged and never fail the batch.
    pub async fn get_multiple(&self, keys: &[String]) -> HashMap<String, Entry> {
        self.fetch(keys, &Tier::READ_ORDER).await.0
    }

    /// Fetch `keys` from the mirror only.
    pub async fn get_multiple_in_memory(&self, keys: &[String]) -> HashMap<String, Entry> {
        self.fetch(keys, &[Tier::Local]).await.0
    }

    /// [`get_multiple`](Self::get_multiple) with hit, miss and error counts.
    pub async fn get_multiple_with_stats(&self, keys: &[String]) -> (HashMap<String, Entry>, FetchStats) {
        self.fetch(keys, &Tier::READ_ORDER).await
    }

    /// [`get_multiple_in_memory`](Self::get_multiple_in_memory) with hit, miss and error counts.
    pub async fn get_multiple_in_memory_with_stats(&self, keys: &[String]) -> (HashMap<String, Entry>, FetchStats) {
        self.fetch(keys, &[Tier::Local]).await
    }

    /// List mirror keys matching `filter`.
    pub async fn list_keys(&self, filter: &str) -> Result<Vec<String>, KvError> {
        self.local.keys(filter).await
    }

    /// Watch `keys` on both tiers through one merged stream.
    ///
    /// The returned watcher must be stopped (or dropped) to release its subscriptions.
    pub async fn watch_multiple(&self, keys: &[String]) -> Result<MergedWatcher, WatchError> {
        open_merged_watch(self, keys, &Tier::READ_ORDER).await
    }

    /// Watch `keys` on the mirror only.
    pub async fn watch_multiple_in_memory(&self, keys: &[String]) -> Result<MergedWatcher, WatchError> {
        open_merged_watch(self, keys, &[Tier::Local]).await
    }

    async fn fetch(&self, keys: &[String], tiers: &'static [Tier]) -> (HashMap<String, Entry>, FetchStats) {
        let distinct: HashSet<&String> = keys.iter().collect();
        let results = Arc::new(Mutex::new(HashMap::with_capacity(distinct.len())));
        let mut stats = FetchStats {
            requested: distinct.len(),
            ..FetchStats::default()
        };

        let mut tasks = JoinSet::new();
        for key in distinct {
            let store = self.clone();
            let results = Arc::clone(&results);
            let key = key.clone();
            tasks.spawn(async move {
                let mut outcome = KeyOutcome {
                    found: None,
                    errors: 0,
                };
                for &tier in tiers {
                    match store.tier(tier).get(&key).await {
                        Ok(Some(entry)) => {
                            results.lock().insert(key, entry);
                            outcome.found = Some(tier);
                            break;
                        }
                        Ok(None) => debug!(key = %key, %tier, "key not found"),
                        Err(err) => {
                            debug!(key = %key, %tier, error = %err, "key read failed");
                            outcome.errors += 1;
                        }
                    }
                }
                outcome
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => stats.record(&outcome),
                Err(err) => {
                    debug!(error = %err, "key read task failed");
                    stats.errors += 1;
                }
            }
        }

        let results = std::mem::take(&mut *results.lock());
        (results, stats)
    }
}
