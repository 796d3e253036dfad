//! The call envelope shared by all three external AI clients.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::rate_limit::{RateLimitConfig, SlidingWindowLimiter};
use crate::retry::{run_with_retry, RetryConfig};
use crate::usage::UsageTracker;

pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

pub struct CallEnvelope {
    retry: RetryConfig,
    rate_limiter: SlidingWindowLimiter,
    pub usage: UsageTracker,
}

impl CallEnvelope {
    pub fn new(retry: RetryConfig, rate_limit: RateLimitConfig) -> Self {
        Self { retry, rate_limiter: SlidingWindowLimiter::new(rate_limit), usage: UsageTracker::new() }
    }

    /// Runs `attempt` through the rate check and retry wrapper. Usage
    /// accounting is the caller's job once the response is in hand (it
    /// needs the provider's token counts, which this envelope doesn't see) —
    /// callers record against `self.usage` after a successful `call`.
    pub async fn call<T, E, F, Fut>(&self, cancellation: &CancellationToken, attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        let now = now_seconds();
        if let Some(slack) = self.rate_limiter.slack_before_admission(now) {
            tracing::debug!(slack_secs = slack.as_secs_f64(), "rate check slack applied");
            tokio::time::sleep(slack).await;
        }
        self.rate_limiter.record(now_seconds());

        run_with_retry(&self.retry, cancellation, attempt).await
    }
}

impl Default for CallEnvelope {
    fn default() -> Self {
        Self::new(RetryConfig::default(), RateLimitConfig::default())
    }
}
