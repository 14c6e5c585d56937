//! Retry arithmetic. Callers own their attempt counters.

use std::time::Duration;

/// Whether another attempt is allowed after `attempts_so_far` attempts.
pub fn can_retry(max_attempts: u32, attempts_so_far: u32) -> bool {
    attempts_so_far < max_attempts
}

/// Delay before retry number `retry` (0-based): `base * min(2^retry, max_factor)`.
pub fn backoff_delay(base: Duration, retry: u32, max_factor: u32) -> Duration {
    let factor = 1u32
        .checked_shl(retry)
        .unwrap_or(u32::MAX)
        .min(max_factor.max(1));
    base.saturating_mul(factor)
}
