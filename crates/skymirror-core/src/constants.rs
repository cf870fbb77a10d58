//! Fixed resource bounds for skymirror.
//!
//! Tiger Style: Constants are fixed and immutable, enforced at compile time.
//! Each constant has an explicit bound to prevent unbounded resource allocation.

use std::time::Duration;

// ============================================================================
// Key-Value Size Limits
// ============================================================================

/// Maximum size of a single key in bytes (1 KB).
pub const MAX_KEY_SIZE: u32 = 1024;

/// Maximum number of dot-separated tokens in a key or pattern.
pub const MAX_KEY_TOKENS: usize = 32;

/// Maximum size of a single value in bytes (1 MB).
///
/// Flight records are a few kilobytes; anything larger is a producer bug.
pub const MAX_VALUE_SIZE: u32 = 1024 * 1024;

/// Maximum number of keys (including delete markers) held by one bucket.
pub const MAX_KEYS_PER_BUCKET: usize = 100_000;

/// Maximum number of keys returned by a single key listing.
pub const MAX_LIST_KEYS: usize = MAX_KEYS_PER_BUCKET;

// ============================================================================
// Watch Limits
// ============================================================================

/// Capacity of a single key watcher's update channel.
///
/// A consumer that falls this far behind applies backpressure to the
/// producing bucket task (memory tier) or starts dropping events with a
/// slow-consumer warning (remote tier).
pub const KEY_WATCH_BUFFER: usize = 256;

/// Capacity of the broadcast ring that fans bucket writes out to watch tasks.
pub const BUCKET_BROADCAST_BUFFER: usize = 4096;

/// Capacity of the merged update channel handed to `watch_multiple` callers.
///
/// Intentionally small: a slow consumer must create backpressure rather than
/// unbounded queuing.
pub const MERGED_WATCH_BUFFER: usize = 64;

/// Maximum number of keys accepted by one multi-key watch.
pub const MAX_WATCH_KEYS: usize = 1024;

// ============================================================================
// Mirror Replication
// ============================================================================

/// Initial delay before a mirror reconnects to its source.
pub const MIRROR_RECONNECT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Maximum delay between mirror reconnect attempts.
pub const MIRROR_RECONNECT_MAX_BACKOFF: Duration = Duration::from_secs(10);

// ============================================================================
// Compile-Time Constant Assertions
// ============================================================================

const _: () = assert!(MAX_KEY_SIZE > 0);
const _: () = assert!(MAX_KEY_TOKENS > 0);
const _: () = assert!(MAX_VALUE_SIZE > MAX_KEY_SIZE);
const _: () = assert!(MAX_KEYS_PER_BUCKET > 0);
const _: () = assert!(MAX_LIST_KEYS <= MAX_KEYS_PER_BUCKET);
const _: () = assert!(KEY_WATCH_BUFFER > 0);
const _: () = assert!(BUCKET_BROADCAST_BUFFER >= KEY_WATCH_BUFFER);
const _: () = assert!(MERGED_WATCH_BUFFER > 0);
const _: () = assert!(MAX_WATCH_KEYS > 0);
