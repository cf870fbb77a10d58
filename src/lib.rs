//! Mirrored key-value data layer for flight tracking.
//!
//! A node keeps a replicated, memory-resident mirror of the authoritative
//! remote `flights` bucket and serves reads through it:
//!
//! - [`bootstrap`] starts an embedded leaf, declares the mirror bucket and
//!   connects to the remote store.
//! - [`FlightStore::get_multiple`] reads each key from the mirror first and
//!   falls back to the remote bucket.
//! - [`FlightStore::watch_multiple`] merges live updates for many keys across
//!   both tiers into one bounded stream.
//! - [`Client`] ties these together with fetch triggers and one shutdown.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod keys;
pub mod store;
pub mod warmup;
pub mod watch;

pub use bootstrap::BootstrapError;
pub use bootstrap::BootstrapHandles;
pub use bootstrap::Publisher;
pub use bootstrap::ShutdownHandle;
pub use bootstrap::bootstrap;
pub use bootstrap::bootstrap_with_leaf;
pub use client::Client;
pub use client::ClientError;
pub use config::ClientConfig;
pub use config::ConfigError;
pub use config::WarmupConfig;
pub use keys::FlightKeyFilter;
pub use keys::owned_flight_key;
pub use keys::owned_flights_pattern;
pub use store::FetchStats;
pub use store::FlightStore;
pub use store::Tier;
pub use warmup::WarmupError;
pub use warmup::WarmupReport;
pub use warmup::warm_mirror;
pub use watch::MergedWatcher;
pub use watch::WatchError;
