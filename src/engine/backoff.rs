// ── Gisma Link: Reconnect Backoff ──────────────────────────────────────────
//
// Exponential reconnect schedule for the STOMP connection:
//   delay(attempt) = min(base * 2^attempt, cap)
// `attempt` is 0-based and unbounded; the exponent is clamped so the
// multiplication never overflows.

use std::time::Duration;

/// Compute the reconnect delay for a 0-based `attempt`.
pub fn reconnect_delay(base: Duration, attempt: u32, cap: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let scaled = base_ms.saturating_mul(2u64.pow(attempt.min(20)));
    Duration::from_millis(scaled.min(cap.as_millis() as u64))
}
