//! Memory-resident key-value bucket.
//!
//! [`MemoryBucket`] is the storage class of the local mirror and of every
//! bucket hosted by the network KV server. It keeps the latest entry per key
//! in a `BTreeMap`, assigns per-bucket revisions, and fans writes out to live
//! watches through a broadcast ring.
//!
//! Writes publish to the broadcast while holding the write lock, and a new
//! watch subscribes while holding the read lock. A watch's initial snapshot
//! and its live stream therefore never overlap or leave a gap.

mod bucket;

pub use bucket::MemoryBucket;
