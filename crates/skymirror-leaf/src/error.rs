use skymirror_core::KvError;
use skymirror_transport::TransportError;
use snafu::Snafu;

/// Errors from the leaf node.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LeafError {
    /// A configured remote has an unusable URL.
    #[snafu(display("invalid leaf remote for domain '{domain}': {source}"))]
    InvalidRemote { domain: String, source: TransportError },

    /// Two remotes claim the same domain.
    #[snafu(display("duplicate leaf remote for domain '{domain}'"))]
    DuplicateDomain { domain: String },

    /// No remote serves the domain a mirror asked for.
    #[snafu(display("no leaf remote serves domain '{domain}' (mirror of '{source_bucket}')"))]
    NoRemoteForDomain { domain: String, source_bucket: String },

    #[snafu(display("invalid bucket name '{name}': {source}"))]
    InvalidBucketName { name: String, source: KvError },

    /// The leaf node was shut down.
    #[snafu(display("leaf node is shut down"))]
    Shutdown,
}
