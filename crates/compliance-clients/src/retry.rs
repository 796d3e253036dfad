//! Exponential backoff with jitter, shared by every external AI client
//! ("Retry wrapper").

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Substrings (case-insensitive) that mark an error as not worth retrying
///.
const NON_RETRYABLE_MARKERS: &[&str] = &[
    "invalid api key",
    "authentication",
    "insufficient_quota",
    "invalid_request",
    "content_policy_violation",
];

#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    !NON_RETRYABLE_MARKERS.iter().any(|marker| lower.contains(marker))
}

fn jittered_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let raw = config.base_delay.as_secs_f64() * config.multiplier.powi(attempt as i32);
    let capped = raw.min(config.max_delay.as_secs_f64());
    let mut rng = rand::thread_rng();
    let jittered = rng.gen_range((capped * 0.5)..=capped);
    Duration::from_secs_f64(jittered.max(0.0))
}

/// Runs `attempt` up to `config.max_retries + 1` times with exponential
/// backoff and jitter between tries. Cancellation is checked before every
/// attempt and propagates immediately without retrying.
pub async fn run_with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    cancellation: &CancellationToken,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut last_error: Option<String> = None;

    for attempt_number in 0..=config.max_retries {
        if cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let message = err.to_string();
                if !is_retryable(&message) {
                    return Err(Error::NonRetryable(message));
                }
                tracing::warn!(attempt = attempt_number, error = %message, "provider call failed, retrying");
                last_error = Some(message);

                if attempt_number < config.max_retries {
                    let delay = jittered_delay(config, attempt_number);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancellation.cancelled() => return Err(Error::Cancelled),
                    }
                }
            }
        }
    }

    Err(Error::RetriesExhausted {
        attempts: config.max_retries + 1,
        source: last_error.unwrap_or_else(|| "unknown error".to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn recognizes_non_retryable_markers_case_insensitively() {
        assert!(!is_retryable("Invalid API Key provided"));
        assert!(!is_retryable("Authentication failed"));
        assert!(!is_retryable("insufficient_quota: account out of credits"));
        assert!(is_retryable("connection reset by peer"));
    }

    #[tokio::test]
    async fn succeeds_without_retry_when_first_attempt_works() {
        let config = RetryConfig { max_retries: 2, ..Default::default() };
        let cancellation = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32> = run_with_retry(&config, &cancellation, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<u32, String>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retries: 3,
            ..Default::default()
        };
        let cancellation = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32> = run_with_retry(&config, &cancellation, || {
            let calls = calls_clone.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("rate limited, try again".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let config = RetryConfig { max_retries: 5, ..Default::default() };
        let cancellation = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<u32> = run_with_retry(&config, &cancellation, || {
            let calls = calls_clone.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, String>("invalid api key".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::NonRetryable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_the_last_error() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_retries: 2,
            ..Default::default()
        };
        let cancellation = CancellationToken::new();

        let result: Result<u32> =
            run_with_retry(&config, &cancellation, || async { Err::<u32, String>("still down".to_string()) })
                .await;

        match result {
            Err(Error::RetriesExhausted { attempts, source }) => {
                assert_eq!(attempts, 3);
                assert_eq!(source, "still down");
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_short_circuits_before_first_attempt() {
        let config = RetryConfig::default();
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result: Result<u32> =
            run_with_retry(&config, &cancellation, || async { Ok::<u32, String>(1) }).await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
