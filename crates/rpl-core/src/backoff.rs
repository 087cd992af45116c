use std::time::Duration;

/// Pure exponential backoff used by bounded retries.
///
/// `retry_number` counts retries, not attempts: the first retry waits `base`,
/// each subsequent one doubles, capped at `max`. Retry 0 (the first attempt) is immediate.
pub fn exponential_backoff(retry_number: u32, base: Duration, max: Duration) -> Duration {
    if retry_number == 0 {
        return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(retry_number - 1).unwrap_or(u32::MAX);
    base.checked_mul(factor).map(|d| d.min(max)).unwrap_or(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        assert_eq!(exponential_backoff(0, base, max), Duration::ZERO);
        assert_eq!(exponential_backoff(1, base, max), Duration::from_millis(100));
        assert_eq!(exponential_backoff(2, base, max), Duration::from_millis(200));
        assert_eq!(exponential_backoff(3, base, max), Duration::from_millis(400));
        assert_eq!(exponential_backoff(5, base, max), max);
        assert_eq!(exponential_backoff(64, base, max), max);
    }
}
