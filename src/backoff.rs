//! Capped exponential backoff.

use std::time::Duration;

/// Exponent ceiling; `2^16` times any sane base already exceeds every cap.
const MAX_EXPONENT: u32 = 16;

/// `min(base * 2^attempt, cap)`. Attempt 0 waits `base`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    base.saturating_mul(1u32 << attempt.min(MAX_EXPONENT))
        .min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_then_caps() {
        let base = Duration::from_millis(100);
        let cap = Duration::from_secs(2);
        assert_eq!(backoff_delay(0, base, cap), Duration::from_millis(100));
        assert_eq!(backoff_delay(1, base, cap), Duration::from_millis(200));
        assert_eq!(backoff_delay(3, base, cap), Duration::from_millis(800));
        assert_eq!(backoff_delay(5, base, cap), cap);
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let cap = Duration::from_secs(30);
        assert_eq!(backoff_delay(u32::MAX, Duration::from_secs(1), cap), cap);
        assert_eq!(
            backoff_delay(40, Duration::from_secs(u64::MAX / 2), Duration::MAX),
            Duration::MAX
        );
    }
}
