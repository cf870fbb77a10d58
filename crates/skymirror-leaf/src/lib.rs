//! Embedded leaf node.
//!
//! A [`LeafNode`] runs in-process, hosts memory buckets, and keeps mirrored
//! buckets replicated from a remote store reached through one of its leaf
//! remotes. Remotes are selected by domain, so a bucket declares
//! `MirrorSource { name, domain }` and the leaf decides where to dial.
//!
//! Replication is asynchronous. Declaring a mirror configures it; the local
//! bucket catches up in the background and its progress is observable
//! through [`MirrorStatus`].

mod config;
mod error;
mod mirror;
mod node;

pub use config::BucketConfig;
pub use config::LeafConfig;
pub use config::LeafRemote;
pub use config::MirrorSource;
pub use config::StorageType;
pub use error::LeafError;
pub use mirror::MirrorPhase;
pub use mirror::MirrorStatus;
pub use node::LeafNode;
