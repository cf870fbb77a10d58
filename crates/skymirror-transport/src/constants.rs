//! Constants for the skymirror wire protocol.

use std::time::Duration;

/// Protocol version sent in the client hello.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum size of a single frame body (2 MB).
///
/// Must hold one maximum-size value plus its key and envelope.
pub const MAX_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Timeout for the hello/ack handshake, enforced on both sides.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for establishing a TCP connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single request/response exchange.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum number of requests awaiting a response on one connection.
pub const MAX_PENDING_REQUESTS: usize = 1024;

/// Capacity of a connection's outbound frame queue.
pub const OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Maximum number of watches open on one connection.
pub const MAX_WATCHES_PER_CONNECTION: usize = 1024;

/// Maximum number of concurrent client connections per server.
///
/// Tiger Style: Fixed upper bound on connections.
pub const MAX_SERVER_CONNECTIONS: usize = 256;

/// Size of the broadcast buffer for published messages.
pub const PUBLISH_BROADCAST_BUFFER: usize = 1024;

/// Maximum size of a client name in the hello.
pub const MAX_CLIENT_NAME_SIZE: usize = 256;

// ============================================================================
// Compile-Time Constant Assertions
// ============================================================================

const _: () = assert!(PROTOCOL_VERSION > 0);
const _: () = assert!(MAX_FRAME_SIZE > skymirror_core::MAX_VALUE_SIZE as usize);
const _: () = assert!(MAX_PENDING_REQUESTS > 0);
const _: () = assert!(OUTBOUND_QUEUE_SIZE > 0);
const _: () = assert!(MAX_WATCHES_PER_CONNECTION > 0);
const _: () = assert!(MAX_SERVER_CONNECTIONS > 0);
const _: () = assert!(PUBLISH_BROADCAST_BUFFER > 0);
