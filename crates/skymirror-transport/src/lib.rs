//! Wire transport for skymirror.
//!
//! Provides the remote tier of the mirrored store:
//!
//! - [`wire`]: `[u32 big-endian length][postcard body]` framing
//! - [`protocol`]: hello handshake, id-tagged requests and pushed watch events
//! - [`RemoteConnection`] / [`RemoteBucket`]: client implementing [`skymirror_core::KvBucket`]
//! - [`KvServer`]: network KV service hosting memory buckets
//!
//! # Tiger Style
//!
//! - Bounded frame size, pending requests, watches and connections
//! - Explicit timeouts on connect, handshake and every request

pub mod client;
pub mod constants;
pub mod credentials;
pub mod endpoint;
pub mod error;
pub mod protocol;
pub mod server;
pub mod wire;

pub use client::RemoteBucket;
pub use client::RemoteConnection;
pub use credentials::Credentials;
pub use endpoint::RemoteEndpoint;
pub use endpoint::parse_address;
pub use error::TransportError;
pub use server::KvServer;
pub use server::KvServerConfig;
pub use server::PublishedMessage;
