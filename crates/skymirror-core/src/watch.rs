//! Watch subscriptions.
//!
//! A watch is a bounded channel between a producer (a bucket task or the
//! remote connection reader) and one [`KeyWatcher`]. Both sides share a
//! cancellation token: stopping the watcher releases the producer, and the
//! producer observes a dropped watcher through [`WatchSender::stopped`].

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::entry::Entry;

/// Delivery options for a watch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Never deliver delete markers.
    pub ignore_deletes: bool,
    /// Skip the initial snapshot of matching keys; deliver live updates only.
    pub updates_only: bool,
}

impl WatchOptions {
    /// Initial values and live updates, deletes suppressed.
    pub fn ignoring_deletes() -> Self {
        Self {
            ignore_deletes: true,
            updates_only: false,
        }
    }

    /// Skip the initial snapshot.
    pub fn with_updates_only(mut self) -> Self {
        self.updates_only = true;
        self
    }

    /// Whether an entry should reach the watcher under these options.
    pub fn admits(&self, entry: &Entry) -> bool {
        !(self.ignore_deletes && entry.is_delete())
    }
}

/// Outcome of a non-blocking send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The watcher's buffer is full; the entry was not delivered.
    Full,
    /// The watcher was stopped or dropped.
    Closed,
}

/// Create a connected producer/watcher pair.
pub fn watch_channel(pattern: impl Into<String>, capacity: usize) -> (WatchSender, KeyWatcher) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let token = CancellationToken::new();
    let sender = WatchSender {
        tx,
        token: token.clone(),
    };
    let watcher = KeyWatcher {
        pattern: pattern.into(),
        rx,
        stop: WatchStop { token },
    };
    (sender, watcher)
}

/// Cloneable handle that stops one watch.
#[derive(Debug, Clone)]
pub struct WatchStop {
    token: CancellationToken,
}

impl WatchStop {
    /// Stop the watch. Idempotent.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the watch is stopped, including by dropping its watcher.
    pub async fn stopped(&self) {
        self.token.cancelled().await
    }
}

/// Producer side of a watch.
#[derive(Debug, Clone)]
pub struct WatchSender {
    tx: mpsc::Sender<Entry>,
    token: CancellationToken,
}

impl WatchSender {
    /// Send an entry, waiting for buffer space.
    ///
    /// Returns `false` once the watch is stopped or the watcher is gone.
    pub async fn send(&self, entry: Entry) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            result = self.tx.send(entry) => result.is_ok(),
        }
    }

    /// Send without waiting.
    pub fn try_send(&self, entry: Entry) -> Delivery {
        if self.token.is_cancelled() {
            return Delivery::Closed;
        }
        match self.tx.try_send(entry) {
            Ok(()) => Delivery::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }

    /// Resolves when the watch is stopped or the watcher is dropped.
    pub async fn stopped(&self) {
        tokio::select! {
            _ = self.token.cancelled() => {}
            _ = self.tx.closed() => {}
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || self.tx.is_closed()
    }
}

/// Consumer side of a watch: an ordered stream of entries for one pattern.
///
/// Dropping the watcher stops the watch.
#[derive(Debug)]
pub struct KeyWatcher {
    pattern: String,
    rx: mpsc::Receiver<Entry>,
    stop: WatchStop,
}

impl KeyWatcher {
    /// Pattern this watcher was opened with.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next entry, or `None` once the watch is stopped or the producer ended.
    pub async fn recv(&mut self) -> Option<Entry> {
        tokio::select! {
            biased;
            _ = self.stop.token.cancelled() => None,
            entry = self.rx.recv() => entry,
        }
    }

    /// Handle that can stop this watch from elsewhere.
    pub fn stop_handle(&self) -> WatchStop {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }
}

impl Drop for KeyWatcher {
    fn drop(&mut self) {
        self.stop.stop();
    }
}
