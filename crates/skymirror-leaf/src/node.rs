use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use skymirror_core::KvBucket;
use skymirror_core::validate_token;
use skymirror_memory::MemoryBucket;
use snafu::ResultExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;
use tracing::info;

use crate::config::BucketConfig;
use crate::config::LeafConfig;
use crate::config::LeafRemote;
use crate::config::MirrorSource;
use crate::error::DuplicateDomainSnafu;
use crate::error::InvalidBucketNameSnafu;
use crate::error::InvalidRemoteSnafu;
use crate::error::LeafError;
use crate::error::NoRemoteForDomainSnafu;
use crate::mirror::MirrorStatus;
use crate::mirror::MirrorTask;

/// An embedded leaf node hosting memory buckets.
///
/// Cloning shares the node. All hosted buckets and replication tasks live
/// until [`LeafNode::shutdown`].
#[derive(Clone)]
pub struct LeafNode {
    inner: Arc<LeafInner>,
}

struct LeafInner {
    server_name: String,
    remotes: HashMap<String, LeafRemote>,
    buckets: Mutex<HashMap<String, HostedBucket>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

struct HostedBucket {
    config: BucketConfig,
    bucket: Arc<MemoryBucket>,
    mirror: Option<MirrorHandle>,
}

struct MirrorHandle {
    cancel: CancellationToken,
    status: watch::Receiver<MirrorStatus>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for LeafNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafNode")
            .field("server_name", &self.inner.server_name)
            .field("remotes", &self.inner.remotes.keys().collect::<Vec<_>>())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl LeafNode {
    /// Start a leaf node with the given remotes.
    ///
    /// Remotes are validated here but not dialed; each mirror dials its own
    /// remote in the background.
    pub async fn start(config: LeafConfig) -> Result<Self, LeafError> {
        let mut remotes = HashMap::new();
        for remote in config.remotes {
            skymirror_transport::parse_address(&remote.url).context(InvalidRemoteSnafu {
                domain: remote.domain.clone(),
            })?;
            if remotes.contains_key(&remote.domain) {
                return DuplicateDomainSnafu { domain: remote.domain }.fail();
            }
            remotes.insert(remote.domain.clone(), remote);
        }

        info!(
            server_name = %config.server_name,
            domains = ?remotes.keys().collect::<Vec<_>>(),
            "leaf node started"
        );
        Ok(Self {
            inner: Arc::new(LeafInner {
                server_name: config.server_name,
                remotes,
                buckets: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        })
    }

    pub fn server_name(&self) -> &str {
        &self.inner.server_name
    }

    /// Declare a hosted bucket, creating it or updating its mirror.
    ///
    /// Re-declaring a bucket with an identical config returns the existing
    /// bucket untouched. A changed mirror source restarts replication into
    /// the same local bucket.
    pub async fn create_or_update_bucket(&self, config: BucketConfig) -> Result<Arc<MemoryBucket>, LeafError> {
        let inner = &self.inner;
        if inner.cancel.is_cancelled() {
            return Err(LeafError::Shutdown);
        }
        validate_token(&config.name).context(InvalidBucketNameSnafu { name: config.name.clone() })?;
        let remote = match &config.mirror {
            Some(source) => Some(self.remote_for(source)?.clone()),
            None => None,
        };

        let mut buckets = inner.buckets.lock();
        if let Some(hosted) = buckets.get_mut(&config.name) {
            if hosted.config == config {
                debug!(bucket = %config.name, "bucket already declared with identical config");
                return Ok(hosted.bucket.clone());
            }

            let previous = hosted.mirror.take().map(|mirror| {
                mirror.cancel.cancel();
                mirror.task
            });
            info!(bucket = %config.name, mirror = ?config.mirror, "bucket config changed, restarting replication");
            hosted.mirror = match (&config.mirror, remote) {
                (Some(source), Some(remote)) => {
                    Some(self.spawn_mirror(hosted.bucket.clone(), source.clone(), remote, previous))
                }
                _ => None,
            };
            hosted.config = config;
            return Ok(hosted.bucket.clone());
        }

        let bucket = Arc::new(MemoryBucket::new(config.name.clone()));
        let mirror = match (&config.mirror, remote) {
            (Some(source), Some(remote)) => Some(self.spawn_mirror(bucket.clone(), source.clone(), remote, None)),
            _ => None,
        };
        info!(bucket = %config.name, mirror = ?config.mirror, "bucket created");
        buckets.insert(config.name.clone(), HostedBucket {
            config,
            bucket: bucket.clone(),
            mirror,
        });
        Ok(bucket)
    }

    /// Hosted bucket by name.
    pub fn bucket(&self, name: &str) -> Option<Arc<MemoryBucket>> {
        self.inner.buckets.lock().get(name).map(|hosted| hosted.bucket.clone())
    }

    /// Names of all hosted buckets, sorted.
    pub fn bucket_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.buckets.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Current replication status of a mirrored bucket.
    pub fn mirror_status(&self, name: &str) -> Option<MirrorStatus> {
        self.watch_mirror_status(name).map(|status| status.borrow().clone())
    }

    /// Subscribe to replication status changes of a mirrored bucket.
    pub fn watch_mirror_status(&self, name: &str) -> Option<watch::Receiver<MirrorStatus>> {
        let buckets = self.inner.buckets.lock();
        buckets.get(name)?.mirror.as_ref().map(|mirror| mirror.status.clone())
    }

    /// Stop all replication and refuse further bucket declarations.
    ///
    /// Idempotent. Hosted buckets stay readable through handles already
    /// handed out.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if !inner.cancel.is_cancelled() {
            info!(server_name = %inner.server_name, "shutting down leaf node");
        }
        inner.cancel.cancel();
        inner.tasks.close();
        inner.tasks.wait().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn remote_for(&self, source: &MirrorSource) -> Result<&LeafRemote, LeafError> {
        self.inner.remotes.get(&source.domain).ok_or_else(|| {
            NoRemoteForDomainSnafu {
                domain: source.domain.clone(),
                source_bucket: source.name.clone(),
            }
            .build()
        })
    }

    fn spawn_mirror(
        &self,
        local: Arc<MemoryBucket>,
        source: MirrorSource,
        remote: LeafRemote,
        previous: Option<JoinHandle<()>>,
    ) -> MirrorHandle {
        let cancel = self.inner.cancel.child_token();
        let (status_tx, status_rx) = watch::channel(MirrorStatus::new(source.clone()));
        let client_name = format!("{}/{}", self.inner.server_name, local.name());
        let task = MirrorTask {
            local,
            source,
            remote,
            client_name,
            status: status_tx,
            cancel: cancel.clone(),
            previous,
        };
        let task = self.inner.tasks.spawn(task.run());
        MirrorHandle {
            cancel,
            status: status_rx,
            task,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use skymirror_transport::KvServer;
    use skymirror_transport::KvServerConfig;

    use super::*;
    use crate::config::StorageType;
    use crate::mirror::MirrorPhase;

    const WAIT: Duration = Duration::from_secs(5);

    async fn server_with(buckets: &[&str]) -> KvServer {
        KvServer::start(KvServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            buckets: buckets.iter().map(|b| b.to_string()).collect(),
            ..KvServerConfig::default()
        })
        .await
        .unwrap()
    }

    async fn leaf_for(server: &KvServer) -> LeafNode {
        LeafNode::start(LeafConfig {
            server_name: "test-leaf".to_string(),
            remotes: vec![LeafRemote::new(server.url(), "ngs")],
        })
        .await
        .unwrap()
    }

    async fn wait_for_value(bucket: &MemoryBucket, key: &str, expected: Option<&[u8]>) {
        tokio::time::timeout(WAIT, async {
            loop {
                let value = bucket.get(key).await.unwrap().map(|entry| entry.value);
                if value.as_deref() == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("mirror did not converge");
    }

    async fn wait_for_phase(leaf: &LeafNode, bucket: &str, phase: MirrorPhase) {
        let mut status = leaf.watch_mirror_status(bucket).unwrap();
        tokio::time::timeout(WAIT, status.wait_for(|s| s.phase == phase)).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn mirror_replicates_existing_and_live_entries() {
        let server = server_with(&["flights"]).await;
        let source = server.bucket("flights").unwrap();
        source.put("users.1.flights.owned.NZ500", b"scheduled".to_vec()).await.unwrap();

        let leaf = leaf_for(&server).await;
        let mirror = leaf
            .create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "flights", "ngs"))
            .await
            .unwrap();

        wait_for_value(&mirror, "users.1.flights.owned.NZ500", Some(b"scheduled")).await;
        source.put("users.1.flights.owned.NZ500", b"departed".to_vec()).await.unwrap();
        wait_for_value(&mirror, "users.1.flights.owned.NZ500", Some(b"departed")).await;
        source.delete("users.1.flights.owned.NZ500").await.unwrap();
        wait_for_value(&mirror, "users.1.flights.owned.NZ500", None).await;

        let status = leaf.mirror_status("inMemoryFlights").unwrap();
        assert_eq!(status.phase, MirrorPhase::Live);
        assert!(status.applied >= 3);

        leaf.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn redeclaring_same_config_is_idempotent() {
        let server = server_with(&["flights"]).await;
        let leaf = leaf_for(&server).await;
        let config = BucketConfig::memory_mirror("inMemoryFlights", "flights", "ngs");
        let first = leaf.create_or_update_bucket(config.clone()).await.unwrap();
        let second = leaf.create_or_update_bucket(config).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(leaf.bucket_names(), vec!["inMemoryFlights".to_string()]);
        leaf.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected() {
        let server = server_with(&["flights"]).await;
        let leaf = leaf_for(&server).await;
        let result = leaf
            .create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "flights", "elsewhere"))
            .await;
        assert!(matches!(result, Err(LeafError::NoRemoteForDomain { .. })));
        assert!(leaf.bucket("inMemoryFlights").is_none());
        leaf.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn reconciliation_removes_stale_local_keys() {
        let server = server_with(&["flights"]).await;
        server.bucket("flights").unwrap().put("flights.KEEP", b"1".to_vec()).await.unwrap();
        let leaf = leaf_for(&server).await;

        let local = leaf
            .create_or_update_bucket(BucketConfig {
                name: "inMemoryFlights".to_string(),
                storage: StorageType::Memory,
                mirror: None,
            })
            .await
            .unwrap();
        local.put("flights.STALE", b"old".to_vec()).await.unwrap();

        let mirrored = leaf
            .create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "flights", "ngs"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&local, &mirrored));

        wait_for_value(&local, "flights.KEEP", Some(b"1")).await;
        wait_for_value(&local, "flights.STALE", None).await;
        leaf.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn changed_source_restarts_replication() {
        let server = server_with(&["flights", "flights2"]).await;
        server.bucket("flights2").unwrap().put("flights.B", b"2".to_vec()).await.unwrap();
        let leaf = leaf_for(&server).await;

        let mirror = leaf
            .create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "flights", "ngs"))
            .await
            .unwrap();
        wait_for_phase(&leaf, "inMemoryFlights", MirrorPhase::Live).await;

        leaf.create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "flights2", "ngs"))
            .await
            .unwrap();
        wait_for_value(&mirror, "flights.B", Some(b"2")).await;
        assert_eq!(leaf.mirror_status("inMemoryFlights").unwrap().source.name, "flights2");

        leaf.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn missing_source_bucket_keeps_retrying() {
        let server = server_with(&["flights"]).await;
        let leaf = leaf_for(&server).await;
        leaf.create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "absent", "ngs"))
            .await
            .unwrap();

        let mut status = leaf.watch_mirror_status("inMemoryFlights").unwrap();
        tokio::time::timeout(WAIT, status.wait_for(|s| s.last_error.is_some())).await.unwrap().unwrap();

        // The bucket appearing later lets replication converge.
        server.create_bucket("absent").put("flights.X", b"x".to_vec()).await.unwrap();
        let mirror = leaf.bucket("inMemoryFlights").unwrap();
        wait_for_value(&mirror, "flights.X", Some(b"x")).await;

        leaf.shutdown().await;
        server.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_replication_and_refuses_new_buckets() {
        let server = server_with(&["flights"]).await;
        let leaf = leaf_for(&server).await;
        leaf.create_or_update_bucket(BucketConfig::memory_mirror("inMemoryFlights", "flights", "ngs"))
            .await
            .unwrap();

        leaf.shutdown().await;
        leaf.shutdown().await;
        assert!(leaf.is_shutdown());
        assert_eq!(leaf.mirror_status("inMemoryFlights").unwrap().phase, MirrorPhase::Stopped);

        let result = leaf
            .create_or_update_bucket(BucketConfig::memory_mirror("other", "flights", "ngs"))
            .await;
        assert!(matches!(result, Err(LeafError::Shutdown)));
        server.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_domains_are_rejected() {
        let result = LeafNode::start(LeafConfig {
            server_name: "leaf".to_string(),
            remotes: vec![LeafRemote::new("tcp://127.0.0.1:1", "ngs"), LeafRemote::new("127.0.0.1:2", "ngs")],
        })
        .await;
        assert!(matches!(result, Err(LeafError::DuplicateDomain { .. })));

        let result = LeafNode::start(LeafConfig {
            server_name: "leaf".to_string(),
            remotes: vec![LeafRemote::new("nats://nowhere", "ngs")],
        })
        .await;
        assert!(matches!(result, Err(LeafError::InvalidRemote { .. })));
    }
}
