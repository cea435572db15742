//! Generic exponential-backoff retry wrapper.
//!
//! Cross-cutting retry behavior is expressed as a plain higher-order
//! function parameterized by a [`RetryPolicy`], applied only around
//! idempotent read calls. Sink flushes are never wrapped; their write
//! safety comes from the store's dedup-on-merge instead.

use std::fmt::Display;
use std::time::Duration;

use serde::Deserialize;

/// Backoff parameters shared by all wrapped source calls.
///
/// Not mutated after construction; passed by reference.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub backoff_coefficient: f64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            backoff_coefficient: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt `attempt + 1`, where `attempt` is 1-indexed:
    /// `min(initial_delay * backoff_coefficient^(attempt - 1), max_delay)`.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = self
            .backoff_coefficient
            .powi(i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX));
        let ms = (self.initial_delay_ms as f64 * exp).clamp(0.0, self.max_delay_ms as f64);
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            reason = "clamped into [0, max_delay_ms], which fits u64"
        )]
        let ms = ms as u64;
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, the policy is exhausted, or `should_retry`
/// rejects the error.
///
/// On success the value of the first successful attempt is returned. On
/// failure the last error is propagated untouched. Each retry emits a
/// single `warn` notification with the attempt index, total attempts,
/// error and computed delay; the notification never affects control flow.
///
/// # Errors
///
/// Returns the last error produced by `op` once `max_attempts` is
/// exhausted or `should_retry` returns `false`.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_attempts || !should_retry(&err) {
                    return Err(err);
                }
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    call = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use tracing_subscriber::layer::SubscriberExt;

    use super::{RetryPolicy, with_retry};

    /// Counts warn-level events emitted while installed.
    struct WarnCounter(Arc<AtomicU32>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() == tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            ..RetryPolicy::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_two_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(3), "op", |_| true, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("transient"),
                _ => Ok(42),
            }
        })
        .await;

        assert_eq!(result, Ok(42), "third attempt succeeds");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "exactly three attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_propagates_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(&policy(3), "op", |_| true, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down")
        })
        .await;

        assert_eq!(result, Err("down"), "last error surfaces unchanged");
        assert_eq!(calls.load(Ordering::SeqCst), 3, "no attempts beyond the limit");
    }

    #[tokio::test(start_paused = true)]
    async fn predicate_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, &str> = with_retry(&policy(5), "op", |_| false, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal")
        })
        .await;

        assert_eq!(result, Err("fatal"), "non-retryable error propagates");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no retry on rejected error");
    }

    #[tokio::test(start_paused = true)]
    async fn each_retry_emits_exactly_one_notification() {
        let warns = Arc::new(AtomicU32::new(0));
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warns))),
        );

        let calls = AtomicU32::new(0);
        let result = with_retry(&policy(3), "op", |_| true, || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("transient"),
                _ => Ok(7),
            }
        })
        .await;
        assert_eq!(result, Ok(7), "wrapped call still succeeds");
        assert_eq!(
            warns.load(Ordering::SeqCst),
            2,
            "one notification per retry, none for the successful attempt"
        );

        let rejected: Result<u32, &str> =
            with_retry(&policy(3), "op", |_| false, || async { Err("fatal") }).await;
        assert_eq!(rejected, Err("fatal"), "rejected error propagates");
        assert_eq!(
            warns.load(Ordering::SeqCst),
            2,
            "a rejected error is returned, not announced as a retry"
        );
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let p = RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            backoff_coefficient: 2.0,
            max_delay_ms: 5_000,
        };
        assert_eq!(p.delay_after(1), Duration::from_millis(1_000), "first backoff");
        assert_eq!(p.delay_after(2), Duration::from_millis(2_000), "doubled");
        assert_eq!(p.delay_after(3), Duration::from_millis(4_000), "doubled again");
        assert_eq!(p.delay_after(4), Duration::from_millis(5_000), "capped at max");
    }

    #[test]
    fn degenerate_negative_coefficient_clamps_to_zero_delay() {
        let p = RetryPolicy {
            backoff_coefficient: -2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.delay_after(2), Duration::ZERO, "a negative product clamps to no delay");
    }
}
