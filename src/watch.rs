//! Merged watches across keys and tiers.
//!
//! A merged watch opens one subscription per key per tier and forwards every
//! update into a single bounded channel. All forwarding tasks share one
//! cancellation token; [`MergedWatcher::stop`] cancels it, stops every
//! subscription and waits for the forwarders before draining the channel.

use std::fmt;

use skymirror_core::Entry;
use skymirror_core::KeyWatcher;
use skymirror_core::KvError;
use skymirror_core::WatchOptions;
use skymirror_core::WatchStop;
use skymirror_core::constants::MAX_WATCH_KEYS;
use skymirror_core::constants::MERGED_WATCH_BUFFER;
use skymirror_core::validate_pattern;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::warn;

use crate::store::FlightStore;
use crate::store::Tier;

/// Errors opening a merged watch.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WatchError {
    #[snafu(display("a merged watch needs at least one key"))]
    NoKeys,

    #[snafu(display("cannot watch {count} keys at once, maximum is {max}"))]
    TooManyKeys { count: usize, max: usize },

    #[snafu(display("invalid watch key '{key}': {source}"))]
    InvalidKey { key: String, source: KvError },

    /// Opening one underlying subscription failed; all others were released.
    #[snafu(display("failed to open {tier} watch on '{key}': {source}"))]
    Subscribe { key: String, tier: Tier, source: KvError },
}

/// Live updates for a set of keys across one or more tiers.
///
/// Updates carry no deduplication: the same change may arrive once per tier.
/// Treat each update as a signal to re-read the key.
///
/// The caller owns the subscriptions: call [`stop`](Self::stop) when done.
/// Dropping an unstopped watcher releases the subscriptions without waiting
/// for the forwarding tasks.
pub struct MergedWatcher {
    rx: mpsc::Receiver<Entry>,
    stops: Vec<WatchStop>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    stopped: bool,
}

impl fmt::Debug for MergedWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergedWatcher")
            .field("subscriptions", &self.stops.len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl MergedWatcher {
    /// Next update from any subscription.
    ///
    /// Returns `None` once stopped, or when every subscription has ended.
    pub async fn recv(&mut self) -> Option<Entry> {
        if self.stopped {
            return None;
        }
        self.rx.recv().await
    }

    /// Stop every subscription and wait for the forwarding tasks to exit.
    ///
    /// Must be called once. A second call is ignored with a warning.
    pub async fn stop(&mut self) {
        if self.stopped {
            warn!(subscriptions = self.stops.len(), "merged watch already stopped, ignoring");
            return;
        }
        self.release().await;
    }

    /// Underlying subscriptions opened for this watch.
    pub fn subscription_count(&self) -> usize {
        self.stops.len()
    }

    /// Underlying subscriptions that have not stopped.
    pub fn active_subscriptions(&self) -> usize {
        self.stops.iter().filter(|stop| !stop.is_stopped()).count()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    async fn release(&mut self) {
        self.stopped = true;
        self.cancel.cancel();
        for stop in &self.stops {
            stop.stop();
        }
        self.tasks.close();
        self.tasks.wait().await;

        self.rx.close();
        let mut discarded = 0usize;
        while self.rx.try_recv().is_ok() {
            discarded += 1;
        }
        debug!(subscriptions = self.stops.len(), discarded, "merged watch stopped");
    }
}

impl Drop for MergedWatcher {
    fn drop(&mut self) {
        if self.stopped {
            return;
        }
        self.cancel.cancel();
        for stop in &self.stops {
            stop.stop();
        }
        self.tasks.close();
    }
}

/// Open a merged watch on `keys` across `tiers`, in tier order per key.
pub(crate) async fn open_merged_watch(
    store: &FlightStore,
    keys: &[String],
    tiers: &[Tier],
) -> Result<MergedWatcher, WatchError> {
    if keys.is_empty() {
        return NoKeysSnafu.fail();
    }
    if keys.len() > MAX_WATCH_KEYS {
        return TooManyKeysSnafu {
            count: keys.len(),
            max: MAX_WATCH_KEYS,
        }
        .fail();
    }
    for key in keys {
        validate_pattern(key).context(InvalidKeySnafu { key: key.clone() })?;
    }

    let (tx, rx) = mpsc::channel(MERGED_WATCH_BUFFER);
    // Built up front so that dropping this future mid-setup still releases what was opened.
    let mut merged = MergedWatcher {
        rx,
        stops: Vec::with_capacity(keys.len() * tiers.len()),
        cancel: CancellationToken::new(),
        tasks: TaskTracker::new(),
        stopped: false,
    };

    for key in keys {
        for &tier in tiers {
            let watcher = match store.tier(tier).watch(key, WatchOptions::ignoring_deletes()).await {
                Ok(watcher) => watcher,
                Err(source) => {
                    warn!(key = %key, %tier, error = %source, opened = merged.stops.len(), "merged watch setup failed");
                    merged.release().await;
                    return Err(WatchError::Subscribe {
                        key: key.clone(),
                        tier,
                        source,
                    });
                }
            };
            merged.stops.push(watcher.stop_handle());
            merged.tasks.spawn(forward(watcher, tx.clone(), merged.cancel.clone()));
        }
    }

    debug!(keys = keys.len(), subscriptions = merged.stops.len(), "merged watch opened");
    Ok(merged)
}

/// Forward one subscription into the merged channel until cancelled or either side ends.
async fn forward(mut watcher: KeyWatcher, tx: mpsc::Sender<Entry>, cancel: CancellationToken) {
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = watcher.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = tx.send(entry) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    watcher.stop();
}
