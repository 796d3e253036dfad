//! Per-service sliding-window rate check ("Rate check"). Advisory
//! only — server-side limits remain authoritative; this just adds a small
//! slack delay before admission when we're clearly about to exceed our own
//! budget.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { per_minute: 60, per_hour: 3000 }
    }
}

/// Tracks call timestamps (monotonic seconds since the limiter was created)
/// and decides whether admitting one more call right now would exceed
/// either window.
pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    calls: Mutex<VecDeque<f64>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, calls: Mutex::new(VecDeque::new()) }
    }

    /// Records admission of one call at `now` (seconds), trimming entries
    /// older than an hour.
    pub fn record(&self, now: f64) {
        let mut calls = self.calls.lock().expect("rate limiter lock poisoned");
        calls.push_back(now);
        while calls.front().is_some_and(|&t| now - t > 3600.0) {
            calls.pop_front();
        }
    }

    /// Advisory sleep duration to apply before the call proceeds; `None` if
    /// neither window is at risk of being exceeded.
    pub fn slack_before_admission(&self, now: f64) -> Option<Duration> {
        let calls = self.calls.lock().expect("rate limiter lock poisoned");
        let last_minute = calls.iter().filter(|&&t| now - t <= 60.0).count() as u32;
        let last_hour = calls.iter().filter(|&&t| now - t <= 3600.0).count() as u32;

        if last_minute >= self.config.per_minute || last_hour >= self.config.per_hour {
            let mut rng = rand::thread_rng();
            Some(Duration::from_secs_f64(rng.gen_range(1.5..=2.0)))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_slack_when_well_under_budget() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig::default());
        for i in 0..5 {
            limiter.record(i as f64);
        }
        assert!(limiter.slack_before_admission(5.0).is_none());
    }

    #[test]
    fn slack_applied_once_per_minute_budget_is_hit() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig { per_minute: 3, per_hour: 1000 });
        limiter.record(0.0);
        limiter.record(1.0);
        limiter.record(2.0);
        let slack = limiter.slack_before_admission(3.0);
        assert!(slack.is_some());
        let slack = slack.unwrap();
        assert!(slack.as_secs_f64() >= 1.5 && slack.as_secs_f64() <= 2.0);
    }

    #[test]
    fn old_calls_fall_out_of_the_hour_window() {
        let limiter = SlidingWindowLimiter::new(RateLimitConfig { per_minute: 1000, per_hour: 2 });
        limiter.record(0.0);
        limiter.record(10.0);
        assert!(limiter.slack_before_admission(20.0).is_some());

        // Recording far enough in the future should have trimmed both old entries.
        limiter.record(4000.0);
        assert!(limiter.slack_before_admission(4000.0).is_none());
    }
}
