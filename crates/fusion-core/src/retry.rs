//! Backoff calculation for bootstrap retries.
//!
//! The bootstrap fetch retries forever: delay is `base * 2^attempt` with
//! `attempt` starting at 0 and no cap on either the attempt count or the
//! delay. Arithmetic saturates instead of overflowing, so very late attempts
//! simply wait "forever".

use std::time::Duration;

use crate::constants::RETRY_BASE_DELAY_MS;

/// Exponential backoff delay in milliseconds for a zero-based `attempt`.
///
/// Formula: `base_delay_ms * 2^attempt`, saturating at `u64::MAX`.
#[must_use]
pub fn calculate_backoff_delay(attempt: u32, base_delay_ms: u64) -> u64 {
    if attempt >= u64::BITS {
        return if base_delay_ms == 0 { 0 } else { u64::MAX };
    }
    base_delay_ms.saturating_mul(1u64 << attempt)
}

/// Backoff delay for the bootstrap fetch using the protocol base delay.
#[must_use]
pub fn bootstrap_delay(attempt: u32) -> Duration {
    Duration::from_millis(calculate_backoff_delay(attempt, RETRY_BASE_DELAY_MS))
}
