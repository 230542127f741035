//! Hybrid token bucket + sliding window.
//!
//! The bucket absorbs bursts; once it is empty the sliding window caps
//! sustained throughput at `max_requests` per `window`.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::ratelimit::LimiterOptions;

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum WindowOutcome {
    Admitted { remaining: u32 },
    Limited { retry_after: Duration },
}

#[derive(Debug)]
pub(crate) struct HybridWindow {
    max_requests: u32,
    window: Duration,
    burst_size: u32,
    /// Tokens per second.
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    /// Admitted call times, oldest first.
    timestamps: VecDeque<Instant>,
}

impl HybridWindow {
    pub(crate) fn new(options: &LimiterOptions, now: Instant) -> Self {
        let refill_rate = if options.refill_rate.is_finite() {
            options.refill_rate.max(0.0)
        } else {
            0.0
        };

        Self {
            max_requests: options.max_requests,
            window: options.window(),
            burst_size: options.burst_size,
            refill_rate,
            tokens: f64::from(options.burst_size),
            last_refill: now,
            timestamps: VecDeque::new(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(f64::from(self.burst_size));
        self.last_refill = now;
    }

    /// Drop timestamps that are `window` old or older.
    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.saturating_duration_since(*front) >= self.window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub(crate) fn try_acquire(&mut self, now: Instant) -> WindowOutcome {
        self.refill(now);
        self.prune(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            self.timestamps.push_back(now);
            return WindowOutcome::Admitted {
                remaining: self.remaining(),
            };
        }

        if (self.timestamps.len() as u64) < u64::from(self.max_requests) {
            self.timestamps.push_back(now);
            return WindowOutcome::Admitted {
                remaining: self.remaining(),
            };
        }

        WindowOutcome::Limited {
            retry_after: self.retry_after(now),
        }
    }

    /// Time until either the bucket or the window can admit again.
    ///
    /// Falls back to one window length when neither ever will, so a
    /// waiting caller backs off instead of spinning.
    fn retry_after(&self, now: Instant) -> Duration {
        let from_window = if self.max_requests > 0 {
            self.timestamps
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
        } else {
            None
        };

        let from_bucket = if self.refill_rate > 0.0 && self.burst_size > 0 {
            let secs = (1.0 - self.tokens).max(0.0) / self.refill_rate;
            Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
        } else {
            None
        };

        match (from_window, from_bucket) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) | (None, Some(a)) => a,
            (None, None) => self.window,
        }
    }

    /// Calls still available right now, from either the bucket or the window.
    pub(crate) fn remaining(&self) -> u32 {
        let from_bucket = self.tokens.floor() as u32;
        let from_window = self
            .max_requests
            .saturating_sub(u32::try_from(self.timestamps.len()).unwrap_or(u32::MAX));
        from_bucket.max(from_window)
    }

    pub(crate) fn tokens(&self) -> f64 {
        self.tokens
    }

    pub(crate) fn window_count(&self) -> usize {
        self.timestamps.len()
    }
}
