use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rpl_core::exponential_backoff;
use tracing::warn;

/// Classification of a step failure, deciding retry vs giving up.
/// This stays pure and testable; callers map their own error types onto it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureClass {
    /// Infrastructure hiccup (registry 5xx, scanner db download). Retried with backoff.
    Transient,
    /// The input must change before the step can succeed. Never retried.
    Deterministic,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            ..Self::default()
        }
    }

    /// No retries at all; used for steps whose outcome a retry cannot change.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp { reason: String },
}

/// Decide what to do after attempt `attempt_number` (1-based) failed.
pub fn decide_retry(policy: &RetryPolicy, class: FailureClass, attempt_number: u32) -> RetryDecision {
    match class {
        FailureClass::Deterministic => RetryDecision::GiveUp {
            reason: "deterministic failure".to_string(),
        },
        FailureClass::Transient if attempt_number >= policy.max_attempts => RetryDecision::GiveUp {
            reason: format!("transient failure persisted after {attempt_number} attempts"),
        },
        FailureClass::Transient => {
            RetryDecision::RetryAfter(exponential_backoff(attempt_number, policy.base_delay, policy.max_delay))
        }
    }
}

/// Run `op` until it succeeds, fails deterministically, or exhausts the policy.
/// `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut, C>(policy: &RetryPolicy, step: &str, classify: C, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureClass,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => match decide_retry(policy, classify(&e), attempt) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(step, attempt, delay_ms = delay.as_millis() as u64, "transient failure, retrying: {e}");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::GiveUp { reason } => {
                    warn!(step, attempt, "giving up ({reason}): {e}");
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn deterministic_failures_give_up_immediately() {
        let d = decide_retry(&fast(5), FailureClass::Deterministic, 1);
        assert!(matches!(d, RetryDecision::GiveUp { .. }));
    }

    #[test]
    fn transient_failures_back_off_until_bound() {
        let p = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(decide_retry(&p, FailureClass::Transient, 1), RetryDecision::RetryAfter(Duration::from_millis(100)));
        assert_eq!(decide_retry(&p, FailureClass::Transient, 2), RetryDecision::RetryAfter(Duration::from_millis(200)));
        assert!(matches!(decide_retry(&p, FailureClass::Transient, 3), RetryDecision::GiveUp { .. }));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let res: Result<u32, String> = retry_with_backoff(
            &fast(3),
            "push",
            |_| FailureClass::Transient,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err("503".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(res, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = retry_with_backoff(
            &fast(2),
            "scan",
            |_| FailureClass::Transient,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("timeout".to_string()) }
            },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deterministic_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let res: Result<(), String> = retry_with_backoff(
            &fast(5),
            "sign",
            |_| FailureClass::Deterministic,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("bad signature".to_string()) }
            },
        )
        .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
