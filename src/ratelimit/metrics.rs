use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

/// Counters for one limiter.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterMetrics {
    pub total_requests: u64,
    pub allowed_requests: u64,
    /// All rejections, circuit-open ones included.
    pub rejected_requests: u64,
    pub circuit_rejections: u64,
    pub circuit_state_changes: u64,
    /// Mean `retry_after` of rate-limit rejections, in milliseconds.
    pub average_wait_ms: f64,
}

impl LimiterMetrics {
    /// Rejections caused by the window rather than the breaker.
    pub fn rate_limited_requests(&self) -> u64 {
        self.rejected_requests.saturating_sub(self.circuit_rejections)
    }

    pub(crate) fn record_allowed(&mut self) {
        self.total_requests += 1;
        self.allowed_requests += 1;
    }

    pub(crate) fn record_rate_limited(&mut self, retry_after: Duration) {
        self.total_requests += 1;
        self.rejected_requests += 1;

        let n = self.rate_limited_requests() as f64;
        let wait_ms = retry_after.as_secs_f64() * 1000.0;
        self.average_wait_ms += (wait_ms - self.average_wait_ms) / n;
    }

    pub(crate) fn record_circuit_rejection(&mut self) {
        self.total_requests += 1;
        self.rejected_requests += 1;
        self.circuit_rejections += 1;
    }

    pub(crate) fn record_state_change(&mut self) {
        self.circuit_state_changes += 1;
    }

    /// Add another limiter's counters into this one.
    pub fn merge(&mut self, other: &LimiterMetrics) {
        let ours = self.rate_limited_requests() as f64;
        let theirs = other.rate_limited_requests() as f64;

        self.total_requests += other.total_requests;
        self.allowed_requests += other.allowed_requests;
        self.rejected_requests += other.rejected_requests;
        self.circuit_rejections += other.circuit_rejections;
        self.circuit_state_changes += other.circuit_state_changes;

        if ours + theirs > 0.0 {
            self.average_wait_ms =
                (self.average_wait_ms * ours + other.average_wait_ms * theirs) / (ours + theirs);
        }
    }
}

/// Registry-wide view: totals plus a breakdown by channel tag.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedMetrics {
    pub limiter_count: usize,
    pub totals: LimiterMetrics,
    pub by_channel: BTreeMap<String, LimiterMetrics>,
}

impl AggregatedMetrics {
    pub(crate) fn add(&mut self, channel: &str, metrics: &LimiterMetrics) {
        self.limiter_count += 1;
        self.totals.merge(metrics);
        self.by_channel
            .entry(channel.to_string())
            .or_default()
            .merge(metrics);
    }
}
