//! Retry Executor: bounded retries with rate-limit-aware backoff,
//! distinguishing a `RateLimited` variant from ordinary transient failures.
//! Pattern-matching strings in error messages is a fallback, not the
//! contract — callers should classify explicitly wherever possible.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub rate_limit_initial: Duration,
    pub rate_limit_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            rate_limit_initial: Duration::from_secs(65),
            rate_limit_max: Duration::from_secs(120),
        }
    }
}

/// Classification an `fn` attempt's error must report so the executor can
/// choose the right backoff branch. Callers construct this from whatever
/// transport error they see (HTTP status, `reqwest::Error`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// HTTP 429 or a rate-limit phrase match.
    RateLimited,
    /// Network errors, HTTP 408/5xx, timeout phrases: retryable on the
    /// exponential schedule.
    Transient,
    /// HTTP 4xx other than 408/429: propagate immediately.
    Permanent,
}

const RATE_LIMIT_PHRASES: [&str; 3] = ["rate limit", "too many requests", "free-models-per-min"];
const TIMEOUT_PHRASES: [&str; 2] = ["timeout", "timed out"];

/// Fallback classifier for callers that only have an error message and/or
/// status code (the contract is a typed `RateLimited` variant from the
/// transport layer; this is the string-matching fallback).
pub fn classify(status: Option<u16>, message: &str) -> Classification {
    let lower = message.to_lowercase();
    if status == Some(429) || RATE_LIMIT_PHRASES.iter().any(|p| lower.contains(p)) {
        return Classification::RateLimited;
    }
    match status {
        Some(408) => Classification::Transient,
        Some(s) if (500..600).contains(&s) => Classification::Transient,
        Some(s) if (400..500).contains(&s) => Classification::Permanent,
        _ => {
            if TIMEOUT_PHRASES.iter().any(|p| lower.contains(p))
                || lower.contains("econnreset")
                || lower.contains("etimedout")
                || lower.contains("dns")
                || lower.contains("connection refused")
            {
                Classification::Transient
            } else {
                Classification::Permanent
            }
        }
    }
}

pub trait AttemptError {
    fn classification(&self) -> Classification;
    fn describe(&self) -> String;
}

#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    #[error("exhausted {attempts} attempt(s): {last}")]
    Exhausted { attempts: u32, last: String },
    #[error("permanent failure: {0}")]
    Permanent(E),
}

/// Reported on every attempt, for logging/progress-bus integration.
pub struct AttemptReport<'a> {
    pub attempt: u32,
    pub max_attempts: u32,
    pub classification: Classification,
    pub message: &'a str,
    pub next_delay: Option<Duration>,
}

/// Execute `fn_` with up to `policy.max_attempts` retries. `fn_` is called
/// fresh on each attempt (it must be idempotent).
pub async fn run<F, Fut, T, E>(
    mut fn_: F,
    policy: &RetryPolicy,
    mut on_attempt: impl FnMut(AttemptReport<'_>),
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: AttemptError + Clone,
{
    let mut rate_limit_delay = policy.rate_limit_initial;
    let mut last_err: Option<E> = None;

    for attempt in 1..=policy.max_attempts {
        match fn_().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let classification = err.classification();
                let message = err.describe();

                if classification == Classification::Permanent {
                    on_attempt(AttemptReport {
                        attempt,
                        max_attempts: policy.max_attempts,
                        classification,
                        message: &message,
                        next_delay: None,
                    });
                    return Err(RetryError::Permanent(err));
                }

                let is_last = attempt == policy.max_attempts;
                let delay = if is_last {
                    None
                } else if classification == Classification::RateLimited {
                    let d = rate_limit_delay;
                    rate_limit_delay = (rate_limit_delay * 2).min(policy.rate_limit_max);
                    Some(d)
                } else {
                    let exp = policy.base_backoff * 2u32.saturating_pow(attempt.saturating_sub(1));
                    Some(exp.min(policy.max_backoff))
                };

                on_attempt(AttemptReport {
                    attempt,
                    max_attempts: policy.max_attempts,
                    classification,
                    message: &message,
                    next_delay: delay,
                });

                if let Some(d) = delay {
                    warn!(attempt, ?classification, delay_ms = d.as_millis() as u64, "retrying");
                    tokio::time::sleep(d).await;
                }
                last_err = Some(err);
            }
        }
    }

    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
        last: last_err.map(|e| e.describe()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Clone, Debug)]
    struct Fake(Classification, &'static str);
    impl AttemptError for Fake {
        fn classification(&self) -> Classification {
            self.0
        }
        fn describe(&self) -> String {
            self.1.to_string()
        }
    }

    #[test]
    fn classify_http_429_is_rate_limited() {
        assert_eq!(classify(Some(429), "too many requests"), Classification::RateLimited);
    }

    #[test]
    fn classify_5xx_is_transient() {
        assert_eq!(classify(Some(503), "service unavailable"), Classification::Transient);
    }

    #[test]
    fn classify_4xx_non_429_is_permanent() {
        assert_eq!(classify(Some(403), "forbidden"), Classification::Permanent);
    }

    #[test]
    fn classify_phrase_without_status_is_rate_limited() {
        assert_eq!(classify(None, "Error: rate limit exceeded, slow down"), Classification::RateLimited);
    }

    #[tokio::test]
    async fn permanent_error_propagates_immediately() {
        let calls = RefCell::new(0);
        let policy = RetryPolicy::default();
        let result: Result<(), RetryError<Fake>> = run(
            || {
                *calls.borrow_mut() += 1;
                async { Err(Fake(Classification::Permanent, "nope")) }
            },
            &policy,
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(RetryError::Permanent(_))));
        assert_eq!(*calls.borrow(), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_then_succeeds() {
        let calls = RefCell::new(0);
        let policy = RetryPolicy {
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            rate_limit_initial: Duration::from_millis(1),
            rate_limit_max: Duration::from_millis(5),
            ..RetryPolicy::default()
        };
        let result: Result<u32, RetryError<Fake>> = run(
            || {
                let mut c = calls.borrow_mut();
                *c += 1;
                let n = *c;
                async move {
                    if n < 3 {
                        Err(Fake(Classification::Transient, "timeout"))
                    } else {
                        Ok(42)
                    }
                }
            },
            &policy,
            |_| {},
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(*calls.borrow(), 3);
    }

    #[tokio::test]
    async fn rate_limit_at_every_retry_surfaces_failure_without_wedging() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            rate_limit_initial: Duration::from_millis(1),
            rate_limit_max: Duration::from_millis(2),
        };
        let result: Result<(), RetryError<Fake>> = run(
            || async { Err(Fake(Classification::RateLimited, "429")) },
            &policy,
            |_| {},
        )
        .await;
        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 3, .. })));
    }

    #[tokio::test]
    async fn rate_limit_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            rate_limit_initial: Duration::from_millis(10),
            rate_limit_max: Duration::from_millis(15),
        };
        let mut delays = Vec::new();
        let _: Result<(), RetryError<Fake>> = run(
            || async { Err(Fake(Classification::RateLimited, "429")) },
            &policy,
            |report| {
                if let Some(d) = report.next_delay {
                    delays.push(d);
                }
            },
        )
        .await;
        assert_eq!(delays, vec![
            Duration::from_millis(10),
            Duration::from_millis(15),
            Duration::from_millis(15),
        ]);
    }
}
