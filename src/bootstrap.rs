//! Provisioning of the local mirror and the remote connection.
//!
//! Bootstrap runs four dependent steps: start the embedded leaf, declare the
//! mirrored memory bucket, connect to the remote store and bind the remote
//! bucket. A failing step releases everything acquired before it, in reverse
//! order, and reports which step failed.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use skymirror_core::KvError;
use skymirror_leaf::BucketConfig;
use skymirror_leaf::LeafConfig;
use skymirror_leaf::LeafError;
use skymirror_leaf::LeafNode;
use skymirror_leaf::LeafRemote;
use skymirror_memory::MemoryBucket;
use skymirror_transport::Credentials;
use skymirror_transport::RemoteBucket;
use skymirror_transport::RemoteConnection;
use skymirror_transport::RemoteEndpoint;
use skymirror_transport::TransportError;
use snafu::ResultExt;
use snafu::Snafu;
use tracing::info;

use crate::config::ClientConfig;
use crate::config::ConfigError;

/// Errors from [`bootstrap`], one kind per provisioning step.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum BootstrapError {
    #[snafu(display("invalid client configuration: {source}"))]
    InvalidConfig { source: ConfigError },

    #[snafu(display("failed to load credentials from {}: {source}", path.display()))]
    Credentials { path: PathBuf, source: TransportError },

    /// The embedded leaf could not be started.
    #[snafu(display("failed to start embedded transport: {source}"))]
    EmbeddedTransport { source: LeafError },

    /// The mirrored bucket could not be declared on the leaf.
    #[snafu(display("failed to create mirror bucket '{bucket}': {source}"))]
    MirrorCreation { bucket: String, source: LeafError },

    /// The remote store could not be reached.
    #[snafu(display("failed to connect to remote store at {url}: {source}"))]
    RemoteConnection { url: String, source: TransportError },

    /// The remote store does not serve the bucket.
    #[snafu(display("failed to bind remote bucket '{bucket}': {source}"))]
    Bind { bucket: String, source: KvError },
}

impl BootstrapError {
    /// Whether the failure came from reaching the network rather than from configuration.
    pub fn is_connection_error(&self) -> bool {
        match self {
            BootstrapError::RemoteConnection { .. } => true,
            BootstrapError::Bind { source, .. } => source.is_connection_error(),
            _ => false,
        }
    }
}

/// Fire-and-forget publishing on the direct remote connection.
#[derive(Debug, Clone)]
pub struct Publisher {
    connection: RemoteConnection,
}

impl Publisher {
    pub async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), KvError> {
        self.connection.publish(subject, payload).await
    }
}

/// Releases everything [`bootstrap`] acquired.
///
/// Cloning shares the handle; the first [`shutdown`](Self::shutdown) does the work.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    remote: RemoteConnection,
    leaf: LeafNode,
    done: Arc<AtomicBool>,
}

impl ShutdownHandle {
    /// Close the remote connection, then shut down the leaf. Idempotent.
    pub async fn shutdown(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(remote = %self.remote.address(), leaf = %self.leaf.server_name(), "shutting down data layer");
        self.remote.close().await;
        self.leaf.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Live handles to both tiers.
///
/// Replication into `mirror` is configured but not necessarily caught up.
/// See [`warm_mirror`](crate::warm_mirror) for an explicit catch-up pass.
#[derive(Debug)]
pub struct BootstrapHandles {
    pub mirror: Arc<MemoryBucket>,
    pub remote: RemoteBucket,
    pub publisher: Publisher,
    pub shutdown: ShutdownHandle,
    pub leaf: LeafNode,
}

/// Start an embedded leaf and provision both tiers from `config`.
pub async fn bootstrap(config: &ClientConfig) -> Result<BootstrapHandles, BootstrapError> {
    config.validate().context(InvalidConfigSnafu)?;
    let leaf_credentials = load_credentials(config.leaf_credentials_file())?;

    let remote = LeafRemote::new(config.leaf_url(), config.domain.clone())
        .with_credentials(leaf_credentials)
        .with_connect_timeout(config.connect_timeout());
    let leaf = LeafNode::start(LeafConfig {
        server_name: config.leaf_name.clone(),
        remotes: vec![remote],
    })
    .await
    .context(EmbeddedTransportSnafu)?;

    provision(config, leaf).await
}

/// Provision both tiers on an already started leaf.
///
/// The leaf is owned by the result: it is shut down if any step fails.
pub async fn bootstrap_with_leaf(config: &ClientConfig, leaf: LeafNode) -> Result<BootstrapHandles, BootstrapError> {
    if let Err(source) = config.validate() {
        leaf.shutdown().await;
        return Err(BootstrapError::InvalidConfig { source });
    }
    provision(config, leaf).await
}

async fn provision(config: &ClientConfig, leaf: LeafNode) -> Result<BootstrapHandles, BootstrapError> {
    let credentials = match load_credentials(config.credentials_file.as_deref()) {
        Ok(credentials) => credentials,
        Err(err) => {
            leaf.shutdown().await;
            return Err(err);
        }
    };

    let declared =
        BucketConfig::memory_mirror(config.mirror_bucket.clone(), config.source_bucket.clone(), config.domain.clone());
    let mirror = match leaf.create_or_update_bucket(declared).await {
        Ok(mirror) => mirror,
        Err(source) => {
            leaf.shutdown().await;
            return Err(BootstrapError::MirrorCreation {
                bucket: config.mirror_bucket.clone(),
                source,
            });
        }
    };
    info!(
        bucket = %config.mirror_bucket,
        source = %config.source_bucket,
        domain = %config.domain,
        "mirror configured"
    );

    let endpoint = RemoteEndpoint::new(config.remote_url.clone())
        .with_credentials(credentials)
        .with_client_name(config.client_name.clone())
        .with_connect_timeout(config.connect_timeout());
    let connection = match RemoteConnection::connect(&endpoint).await {
        Ok(connection) => connection,
        Err(source) => {
            leaf.shutdown().await;
            return Err(BootstrapError::RemoteConnection {
                url: config.remote_url.clone(),
                source,
            });
        }
    };
    info!(url = %config.remote_url, server = %connection.server_name(), "connected to remote store");

    let remote = match connection.bucket(&config.source_bucket).await {
        Ok(remote) => remote,
        Err(source) => {
            connection.close().await;
            leaf.shutdown().await;
            return Err(BootstrapError::Bind {
                bucket: config.source_bucket.clone(),
                source,
            });
        }
    };
    info!(bucket = %config.source_bucket, "bound remote bucket");

    Ok(BootstrapHandles {
        mirror,
        remote,
        publisher: Publisher {
            connection: connection.clone(),
        },
        shutdown: ShutdownHandle {
            remote: connection,
            leaf: leaf.clone(),
            done: Arc::new(AtomicBool::new(false)),
        },
        leaf,
    })
}

fn load_credentials(path: Option<&Path>) -> Result<Option<Credentials>, BootstrapError> {
    path.map(|path| Credentials::from_file(path).context(CredentialsSnafu { path })).transpose()
}
