//! Small shared helpers.

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Current time in milliseconds since the Unix epoch.
///
/// Returns 0 if the system clock is before the epoch.
#[inline]
pub fn current_time_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}
