//! Per-service usage accounting ("Usage accounting").

use std::collections::HashMap;
use std::sync::Mutex;

/// Static per-model price table: input/output cost per 1K tokens. Speech
/// models are priced per audio-minute instead (stored in the same map under
/// `per_audio_minute`, `input`/`output` left at 0).
#[derive(Clone, Copy, Debug)]
pub struct ModelPrice {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub per_audio_minute: f64,
}

impl ModelPrice {
    pub const fn text(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self { input_per_1k, output_per_1k, per_audio_minute: 0.0 }
    }

    pub const fn audio(per_audio_minute: f64) -> Self {
        Self { input_per_1k: 0.0, output_per_1k: 0.0, per_audio_minute }
    }
}

pub fn price_table() -> HashMap<&'static str, ModelPrice> {
    HashMap::from([
        ("gpt-4o", ModelPrice::text(0.0025, 0.010)),
        ("gpt-4o-mini", ModelPrice::text(0.00015, 0.0006)),
        ("whisper-1", ModelPrice::audio(0.006)),
    ])
}

#[derive(Clone, Debug, Default)]
pub struct UsageTotals {
    pub total_calls: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
}

/// Usage accounting for one external service (vision, speech, remote GPU).
/// `minute_bucket` holds `(minute, calls)` entries for the trailing five
/// minutes, used for lightweight throughput introspection.
pub struct UsageTracker {
    totals: Mutex<UsageTotals>,
    minute_buckets: Mutex<Vec<(u64, u64)>>,
}

impl Default for UsageTracker {
    fn default() -> Self {
        Self { totals: Mutex::new(UsageTotals::default()), minute_buckets: Mutex::new(Vec::new()) }
    }
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, now_minute: u64, input_tokens: u64, output_tokens: u64, price: ModelPrice) {
        let cost = (input_tokens as f64 / 1000.0) * price.input_per_1k
            + (output_tokens as f64 / 1000.0) * price.output_per_1k;

        let mut totals = self.totals.lock().expect("usage totals lock poisoned");
        totals.total_calls += 1;
        totals.total_tokens += input_tokens + output_tokens;
        totals.total_cost += cost;
        drop(totals);

        self.bump_minute_bucket(now_minute);
    }

    pub fn record_audio_call(&self, now_minute: u64, audio_minutes: f64, price: ModelPrice) {
        let cost = audio_minutes * price.per_audio_minute;

        let mut totals = self.totals.lock().expect("usage totals lock poisoned");
        totals.total_calls += 1;
        totals.total_cost += cost;
        drop(totals);

        self.bump_minute_bucket(now_minute);
    }

    fn bump_minute_bucket(&self, now_minute: u64) {
        let mut buckets = self.minute_buckets.lock().expect("minute bucket lock poisoned");
        buckets.retain(|(minute, _)| now_minute.saturating_sub(*minute) < 5);
        match buckets.iter_mut().find(|(minute, _)| *minute == now_minute) {
            Some((_, calls)) => *calls += 1,
            None => buckets.push((now_minute, 1)),
        }
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals.lock().expect("usage totals lock poisoned").clone()
    }

    /// `(minute, calls)` pairs covering at most the trailing five minutes.
    pub fn recent_minutes(&self) -> Vec<(u64, u64)> {
        self.minute_buckets.lock().expect("minute bucket lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_cost_from_the_price_table() {
        let tracker = UsageTracker::new();
        let price = price_table()["gpt-4o-mini"];
        tracker.record_call(0, 1000, 500, price);

        let totals = tracker.totals();
        assert_eq!(totals.total_calls, 1);
        assert_eq!(totals.total_tokens, 1500);
        assert!((totals.total_cost - (0.00015 + 0.0003)).abs() < 1e-9);
    }

    #[test]
    fn audio_calls_price_per_minute_not_per_token() {
        let tracker = UsageTracker::new();
        let price = price_table()["whisper-1"];
        tracker.record_audio_call(0, 2.5, price);

        let totals = tracker.totals();
        assert_eq!(totals.total_tokens, 0);
        assert!((totals.total_cost - 0.015).abs() < 1e-9);
    }

    #[test]
    fn minute_buckets_drop_entries_older_than_five_minutes() {
        let tracker = UsageTracker::new();
        let price = price_table()["gpt-4o-mini"];
        tracker.record_call(0, 10, 10, price);
        tracker.record_call(10, 10, 10, price);

        let recent = tracker.recent_minutes();
        assert!(recent.iter().all(|(minute, _)| *minute == 10));
    }
}
