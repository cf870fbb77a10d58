//! Client façade over the bootstrapped data layer.

use std::sync::Arc;
use std::time::Duration;

use skymirror_core::KvBucket;
use skymirror_core::KvError;
use skymirror_core::validate_token;
use skymirror_leaf::LeafNode;
use skymirror_leaf::MirrorStatus;
use skymirror_memory::MemoryBucket;
use skymirror_transport::RemoteBucket;
use snafu::ResultExt;
use snafu::Snafu;
use tracing::debug;

use crate::bootstrap::BootstrapError;
use crate::bootstrap::BootstrapHandles;
use crate::bootstrap::Publisher;
use crate::bootstrap::ShutdownHandle;
use crate::bootstrap::bootstrap;
use crate::config::ClientConfig;
use crate::store::FlightStore;
use crate::warmup::WarmupError;
use crate::warmup::WarmupReport;
use crate::warmup::warm_mirror;

/// Errors from [`Client`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ClientError {
    #[snafu(display("{source}"))]
    Bootstrap { source: BootstrapError },

    #[snafu(display("invalid flight id '{flight_id}': {source}"))]
    InvalidFlightId { flight_id: String, source: KvError },

    #[snafu(display("failed to publish to '{subject}': {source}"))]
    Publish { subject: String, source: KvError },

    #[snafu(display("mirror warm-up failed: {source}"))]
    Warmup { source: WarmupError },
}

/// The data layer of a flight-tracking node.
///
/// Construction either returns a fully provisioned client or releases
/// everything it acquired. Call [`shutdown`](Self::shutdown) when done.
#[derive(Debug)]
pub struct Client {
    flights: FlightStore,
    mirror: Arc<MemoryBucket>,
    remote: RemoteBucket,
    publisher: Publisher,
    shutdown: ShutdownHandle,
    leaf: LeafNode,
    fetch_subject_prefix: String,
}

impl Client {
    /// Bootstrap both tiers from `config`.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let handles = bootstrap(&config).await.context(BootstrapSnafu)?;
        Ok(Self::from_handles(handles, config.fetch_subject_prefix))
    }

    /// Assemble a client from already provisioned handles.
    pub fn from_handles(handles: BootstrapHandles, fetch_subject_prefix: impl Into<String>) -> Self {
        let BootstrapHandles {
            mirror,
            remote,
            publisher,
            shutdown,
            leaf,
        } = handles;
        let flights = FlightStore::new(mirror.clone(), Arc::new(remote.clone()));
        Self {
            flights,
            mirror,
            remote,
            publisher,
            shutdown,
            leaf,
            fetch_subject_prefix: fetch_subject_prefix.into(),
        }
    }

    /// Read-through store over both tiers.
    pub fn flights(&self) -> &FlightStore {
        &self.flights
    }

    /// The local mirror, for diagnostics and enumeration.
    pub fn mirror(&self) -> &Arc<MemoryBucket> {
        &self.mirror
    }

    pub fn remote(&self) -> &RemoteBucket {
        &self.remote
    }

    pub fn leaf(&self) -> &LeafNode {
        &self.leaf
    }

    /// Replication status of the mirror bucket.
    pub fn mirror_status(&self) -> Option<MirrorStatus> {
        self.leaf.mirror_status(self.mirror.name())
    }

    /// Ask the out-of-band producer to refresh one flight.
    ///
    /// Publishes an empty message to `<fetch_subject_prefix>.<flight_id>`.
    pub async fn trigger_fetch(&self, flight_id: &str) -> Result<(), ClientError> {
        validate_token(flight_id).context(InvalidFlightIdSnafu { flight_id })?;
        let subject = format!("{}.{flight_id}", self.fetch_subject_prefix);
        self.publisher.publish(&subject, Vec::new()).await.context(PublishSnafu { subject: subject.clone() })?;
        debug!(subject = %subject, "fetch triggered");
        Ok(())
    }

    /// Copy remote entries matching `filter` into the mirror and wait for each to land.
    pub async fn warm_up(&self, filter: &str, timeout: Duration) -> Result<WarmupReport, ClientError> {
        warm_mirror(&self.remote, self.mirror.as_ref(), filter, timeout).await.context(WarmupSnafu)
    }

    /// Close the remote connection, then stop the leaf. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.shutdown().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_shutdown()
    }
}
