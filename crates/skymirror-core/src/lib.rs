//! Core types and traits for the skymirror key-value layer.
//!
//! This crate provides the vocabulary shared by every tier of the mirrored
//! flight store: the [`Entry`] data model, subject-style key patterns, the
//! [`KvBucket`] trait implemented by the in-memory mirror and the remote
//! client, and the [`KeyWatcher`] subscription handle.
//!
//! # Key Components
//!
//! - **Traits**: [`KvBucket`]
//! - **Types**: [`Entry`], [`Operation`], [`WatchOptions`]
//! - **Watches**: [`KeyWatcher`], [`WatchSender`], [`WatchStop`]
//! - **Constants**: fixed resource bounds in [`constants`]
//!
//! # Tiger Style
//!
//! - Every buffer and collection has an explicit upper bound
//! - Keys and values are validated before they reach a bucket

pub mod constants;
pub mod entry;
pub mod error;
pub mod pattern;
pub mod traits;
pub mod utils;
pub mod validation;
pub mod watch;

pub use constants::KEY_WATCH_BUFFER;
pub use constants::MAX_KEY_SIZE;
pub use constants::MAX_KEYS_PER_BUCKET;
pub use constants::MAX_VALUE_SIZE;
pub use entry::Entry;
pub use entry::Operation;
pub use error::KvError;
pub use pattern::FULL_WILDCARD;
pub use pattern::SINGLE_WILDCARD;
pub use traits::KvBucket;
pub use utils::current_time_ms;
pub use validation::validate_key;
pub use validation::validate_pattern;
pub use validation::validate_token;
pub use validation::validate_value;
pub use watch::Delivery;
pub use watch::KeyWatcher;
pub use watch::WatchOptions;
pub use watch::WatchSender;
pub use watch::WatchStop;
pub use watch::watch_channel;
