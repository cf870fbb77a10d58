//! One-shot catch-up of the local mirror.
//!
//! Mirror replication is asynchronous. A node that must not serve from a cold
//! mirror copies the remote entries in directly and waits until the mirror has
//! reported an update for every copied key.

use std::collections::HashSet;
use std::time::Duration;

use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::WatchOptions;
use snafu::ResultExt;
use snafu::Snafu;
use tokio::time::Instant;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Errors from [`warm_mirror`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum WarmupError {
    #[snafu(display("failed to watch mirror for '{filter}': {source}"))]
    Watch { filter: String, source: KvError },

    #[snafu(display("failed to list remote keys for '{filter}': {source}"))]
    ListKeys { filter: String, source: KvError },

    #[snafu(display("warm-up timed out with {missing} of {copied} keys unconfirmed"))]
    Timeout { missing: usize, copied: usize },
}

/// Outcome of a warm-up pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmupReport {
    /// Remote keys matching the filter.
    pub listed: usize,
    /// Entries written into the mirror.
    pub copied: usize,
    /// Keys that could not be read or written.
    pub failed: usize,
    /// Copied keys confirmed by an update on the mirror.
    pub observed: usize,
    pub elapsed: Duration,
}

/// Copy every remote entry matching `filter` into `mirror` and wait for the mirror to confirm each.
///
/// The mirror watch is opened before anything is copied, so a confirmation
/// can come either from the copy itself or from replication. Per-key failures
/// are logged and counted; only the watch, the listing and the deadline are fatal.
pub async fn warm_mirror<R, M>(
    remote: &R,
    mirror: &M,
    filter: &str,
    timeout: Duration,
) -> Result<WarmupReport, WarmupError>
where
    R: KvBucket + ?Sized,
    M: KvBucket + ?Sized,
{
    let started = Instant::now();
    let deadline = started + timeout;

    let mut watcher = mirror
        .watch(filter, WatchOptions::ignoring_deletes().with_updates_only())
        .await
        .context(WatchSnafu { filter })?;
    let keys = remote.keys(filter).await.context(ListKeysSnafu { filter })?;

    let mut report = WarmupReport {
        listed: keys.len(),
        ..WarmupReport::default()
    };
    let mut pending = HashSet::with_capacity(keys.len());
    for key in keys {
        let entry = match remote.get(&key).await {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                debug!(key = %key, "remote key vanished during warm-up");
                continue;
            }
            Err(err) => {
                warn!(key = %key, error = %err, "warm-up read failed");
                report.failed += 1;
                continue;
            }
        };
        match mirror.put(&key, entry.value).await {
            Ok(_) => {
                report.copied += 1;
                pending.insert(key);
            }
            Err(err) => {
                warn!(key = %key, error = %err, "warm-up write failed");
                report.failed += 1;
            }
        }
    }

    while !pending.is_empty() {
        let next = match tokio::time::timeout_at(deadline, watcher.recv()).await {
            Ok(next) => next,
            Err(_) => {
                watcher.stop();
                return TimeoutSnafu {
                    missing: pending.len(),
                    copied: report.copied,
                }
                .fail();
            }
        };
        let Some(entry) = next else {
            // The mirror closed the watch; nothing more can be confirmed.
            return TimeoutSnafu {
                missing: pending.len(),
                copied: report.copied,
            }
            .fail();
        };
        if pending.remove(&entry.key) {
            report.observed += 1;
        }
    }
    watcher.stop();

    report.elapsed = started.elapsed();
    info!(
        filter,
        listed = report.listed,
        copied = report.copied,
        failed = report.failed,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "mirror warm-up complete"
    );
    Ok(report)
}
