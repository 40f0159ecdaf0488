//! Retry delay arithmetic for environment creation.

use std::time::Duration;

/// Delay to wait after failed attempt number `attempt` (0-indexed).
///
/// The base delay doubles per attempt and saturates instead of overflowing.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}
