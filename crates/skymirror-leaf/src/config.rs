use std::time::Duration;

use skymirror_transport::Credentials;
use skymirror_transport::RemoteEndpoint;
use skymirror_transport::constants::DEFAULT_CONNECT_TIMEOUT;

/// Leaf node settings.
#[derive(Debug, Clone)]
pub struct LeafConfig {
    /// Name used in logs and announced to remotes.
    pub server_name: String,
    /// Remotes used for replication, at most one per domain.
    pub remotes: Vec<LeafRemote>,
}

impl Default for LeafConfig {
    fn default() -> Self {
        Self {
            server_name: "skymirror-leaf".to_string(),
            remotes: Vec::new(),
        }
    }
}

/// A remote store the leaf replicates from.
#[derive(Debug, Clone)]
pub struct LeafRemote {
    pub url: String,
    /// Domain that mirror sources use to select this remote.
    pub domain: String,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
}

impl LeafRemote {
    pub fn new(url: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            domain: domain.into(),
            credentials: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub(crate) fn endpoint(&self, client_name: String) -> RemoteEndpoint {
        RemoteEndpoint::new(self.url.clone())
            .with_credentials(self.credentials.clone())
            .with_client_name(client_name)
            .with_connect_timeout(self.connect_timeout)
    }
}

/// Storage class of a hosted bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Memory,
}

/// The remote bucket a mirror replicates from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSource {
    pub name: String,
    pub domain: String,
}

/// Declaration of a hosted bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub name: String,
    pub storage: StorageType,
    pub mirror: Option<MirrorSource>,
}

impl BucketConfig {
    /// A memory bucket mirroring `source` from the remote serving `domain`.
    pub fn memory_mirror(name: impl Into<String>, source: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            storage: StorageType::Memory,
            mirror: Some(MirrorSource {
                name: source.into(),
                domain: domain.into(),
            }),
        }
    }
}
