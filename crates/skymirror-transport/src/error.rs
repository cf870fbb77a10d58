//! Transport error types.

use std::path::PathBuf;

use skymirror_core::KvError;
use snafu::Snafu;

/// Errors from establishing or running a wire connection.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// The remote URL could not be turned into a socket address.
    #[snafu(display("invalid remote url '{url}': {reason}"))]
    InvalidUrl { url: String, reason: String },

    /// TCP connect failed.
    #[snafu(display("failed to connect to {address}: {source}"))]
    Connect { address: String, source: std::io::Error },

    /// TCP connect did not complete in time.
    #[snafu(display("connecting to {address} timed out after {timeout_ms}ms"))]
    ConnectTimeout { address: String, timeout_ms: u64 },

    /// The server listener could not be bound.
    #[snafu(display("failed to listen on {address}: {source}"))]
    Listen { address: String, source: std::io::Error },

    /// Reading or writing a frame failed.
    #[snafu(display("frame i/o failed: {source}"))]
    FrameIo { source: std::io::Error },

    #[snafu(display("failed to encode frame: {source}"))]
    Encode { source: postcard::Error },

    #[snafu(display("failed to decode frame: {source}"))]
    Decode { source: postcard::Error },

    /// A frame exceeded the maximum size.
    #[snafu(display("frame too large: {size} > {max}"))]
    FrameTooLarge { size: usize, max: usize },

    /// The peer did not complete the handshake in time.
    #[snafu(display("handshake timed out"))]
    HandshakeTimeout,

    /// The server refused the hello.
    #[snafu(display("connection rejected: {reason}"))]
    Rejected { reason: String },

    /// The peer sent a frame that is not valid at this point.
    #[snafu(display("unexpected frame: {context}"))]
    UnexpectedFrame { context: String },

    /// Credentials could not be loaded.
    #[snafu(display("failed to read credentials file {}: {source}", path.display()))]
    ReadCredentials { path: PathBuf, source: std::io::Error },

    /// Credentials were loaded but are unusable.
    #[snafu(display("invalid credentials: {reason}"))]
    InvalidCredentials { reason: String },

    /// The connection is closed.
    #[snafu(display("connection closed"))]
    Closed,
}

impl From<TransportError> for KvError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed | TransportError::FrameIo { .. } => KvError::Closed,
            TransportError::ConnectTimeout { timeout_ms, .. } => KvError::Timeout { duration_ms: timeout_ms },
            TransportError::Rejected { reason } => KvError::Unauthorized { reason },
            other => KvError::failed(other),
        }
    }
}
