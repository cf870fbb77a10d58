//! Mirror replication task.

use std::collections::HashSet;
use std::sync::Arc;

use skymirror_core::Entry;
use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::WatchOptions;
use skymirror_core::constants::MIRROR_RECONNECT_INITIAL_BACKOFF;
use skymirror_core::constants::MIRROR_RECONNECT_MAX_BACKOFF;
use skymirror_core::pattern::FULL_WILDCARD;
use skymirror_memory::MemoryBucket;
use skymirror_transport::RemoteConnection;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::LeafRemote;
use crate::config::MirrorSource;

/// Replication phase of a mirrored bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorPhase {
    /// Dialing the leaf remote, or waiting to retry.
    Connecting,
    /// Bound to the source; reconciling the local copy.
    Syncing,
    /// Applying the source's live stream.
    Live,
    /// Replication was cancelled.
    Stopped,
}

/// Observable replication status of one mirrored bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorStatus {
    pub source: MirrorSource,
    pub phase: MirrorPhase,
    /// Entries applied to the local bucket since the mirror was configured.
    pub applied: u64,
    /// Completed reconnect attempts.
    pub reconnects: u64,
    pub last_error: Option<String>,
}

impl MirrorStatus {
    pub(crate) fn new(source: MirrorSource) -> Self {
        Self {
            source,
            phase: MirrorPhase::Connecting,
            applied: 0,
            reconnects: 0,
            last_error: None,
        }
    }
}

pub(crate) struct MirrorTask {
    pub local: Arc<MemoryBucket>,
    pub source: MirrorSource,
    pub remote: LeafRemote,
    pub client_name: String,
    pub status: watch::Sender<MirrorStatus>,
    pub cancel: CancellationToken,
    /// Replication this task replaces; awaited before starting.
    pub previous: Option<JoinHandle<()>>,
}

impl MirrorTask {
    pub(crate) async fn run(mut self) {
        if let Some(previous) = self.previous.take() {
            let _ = previous.await;
        }

        let bucket = self.local.name().to_string();
        let mut backoff = MIRROR_RECONNECT_INITIAL_BACKOFF;
        info!(bucket = %bucket, source = %self.source.name, domain = %self.source.domain, "mirror replication started");

        loop {
            self.set_phase(MirrorPhase::Connecting);
            let outcome = self.replicate_once().await;

            let was_live = self.status.borrow().phase == MirrorPhase::Live;
            match outcome {
                Ok(()) => break,
                Err(err) => {
                    warn!(
                        bucket = %bucket,
                        source = %self.source.name,
                        error = %err,
                        ?backoff,
                        "mirror replication interrupted, reconnecting"
                    );
                    self.status.send_modify(|status| {
                        status.last_error = Some(err.to_string());
                        status.phase = MirrorPhase::Connecting;
                    });
                }
            }
            if was_live {
                backoff = MIRROR_RECONNECT_INITIAL_BACKOFF;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MIRROR_RECONNECT_MAX_BACKOFF);
            self.status.send_modify(|status| status.reconnects += 1);
        }

        self.set_phase(MirrorPhase::Stopped);
        info!(bucket = %bucket, source = %self.source.name, "mirror replication stopped");
    }

    fn set_phase(&self, phase: MirrorPhase) {
        self.status.send_if_modified(|status| {
            let changed = status.phase != phase;
            status.phase = phase;
            changed
        });
    }

    /// One connection's worth of replication. Returns `Ok` only when cancelled.
    async fn replicate_once(&self) -> Result<(), KvError> {
        let endpoint = self.remote.endpoint(self.client_name.clone());
        let connection = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            connection = RemoteConnection::connect(&endpoint) => connection?,
        };
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Ok(()),
            result = self.replicate_on(&connection) => result,
        };
        connection.close().await;
        result
    }

    async fn replicate_on(&self, connection: &RemoteConnection) -> Result<(), KvError> {
        let source = connection.bucket(&self.source.name).await?;
        self.set_phase(MirrorPhase::Syncing);

        let remote_keys: HashSet<String> = source.keys(FULL_WILDCARD).await?.into_iter().collect();
        let mut watcher = source.watch(FULL_WILDCARD, WatchOptions::default()).await?;

        let mut removed = 0usize;
        for key in self.local.keys(FULL_WILDCARD).await? {
            if !remote_keys.contains(&key) {
                self.local.delete(&key).await?;
                removed += 1;
            }
        }
        debug!(bucket = %self.local.name(), remote_keys = remote_keys.len(), removed, "mirror reconciled");
        self.set_phase(MirrorPhase::Live);

        loop {
            let Some(entry) = watcher.recv().await else {
                return Err(KvError::Closed);
            };
            if self.apply(entry).await? {
                self.status.send_modify(|status| status.applied += 1);
            }
        }
    }

    /// Apply one source entry to the local bucket. Returns whether it changed anything.
    async fn apply(&self, entry: Entry) -> Result<bool, KvError> {
        let current = self.local.get(&entry.key).await?;
        if entry.is_delete() {
            if current.is_none() {
                return Ok(false);
            }
            self.local.delete(&entry.key).await?;
        } else {
            if current.is_some_and(|local| local.value == entry.value) {
                return Ok(false);
            }
            self.local.put(&entry.key, entry.value).await?;
        }
        Ok(true)
    }
}
