//! Rate limiter facade: circuit breaker in front of the hybrid window.
//!
//! All state for one scope sits behind a single mutex, so every decision
//! is one critical section. The lock is never held across an await and
//! observers run after it is released.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::ratelimit::breaker::{CircuitBreaker, CircuitState, CircuitTransition, StateChange};
use crate::ratelimit::metrics::LimiterMetrics;
use crate::ratelimit::window::{HybridWindow, WindowOutcome};
use crate::types::{ChannelTag, ScopeKey};

/// Default upper bound for [`RateLimiter::wait_and_acquire`].
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// Pause between attempts when a rejection carries no retry hint.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_secs(1);

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Callback for circuit state changes.
pub type TransitionObserver = Arc<dyn Fn(&CircuitTransition) + Send + Sync>;

/// Tuning for one limiter. Missing fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimiterOptions {
    /// Sustained ceiling per window once the bucket is empty.
    pub max_requests: u32,
    pub window_ms: u64,
    /// Bucket capacity.
    pub burst_size: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
    /// Metrics grouping tag. Falls back to the provider part of the scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelTag>,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window_ms: 1_000,
            burst_size: 10,
            refill_rate: 1.0,
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
            channel: None,
        }
    }
}

impl LimiterOptions {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn with_channel(mut self, channel: impl Into<ChannelTag>) -> Self {
        self.channel = Some(channel.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    CircuitOpen,
    RateLimited,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircuitOpen => "circuit_open",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcquireResult {
    pub allowed: bool,
    pub remaining: u32,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_millis"
    )]
    pub retry_after: Option<Duration>,
    pub circuit_state: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RejectReason>,
}

fn serialize_millis<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
        None => serializer.serialize_none(),
    }
}

/// Point-in-time view of a limiter, as of its last decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterSnapshot {
    pub scope: ScopeKey,
    pub channel: ChannelTag,
    pub circuit_state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub tokens: f64,
    pub window_count: usize,
    pub remaining: u32,
    pub metrics: LimiterMetrics,
}

/// Error from [`RateLimiter::call`].
#[derive(Debug)]
pub enum GuardedCallError<E> {
    /// The circuit stayed open for the whole wait.
    CircuitOpen,
    /// No slot freed up within the wait.
    Throttled,
    /// The call ran and failed.
    Call(E),
}

impl<E: fmt::Display> fmt::Display for GuardedCallError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CircuitOpen => write!(f, "Circuit open, dependency degraded"),
            Self::Throttled => write!(f, "Rate limited, no slot within wait budget"),
            Self::Call(e) => write!(f, "Call failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for GuardedCallError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Call(e) => Some(e),
            _ => None,
        }
    }
}

struct LimiterInner {
    window: HybridWindow,
    breaker: CircuitBreaker,
    metrics: LimiterMetrics,
}

impl LimiterInner {
    fn note(&mut self, change: Option<StateChange>) -> Option<StateChange> {
        if change.is_some() {
            self.metrics.record_state_change();
        }
        change
    }
}

/// Admission control for one scope key.
pub struct RateLimiter {
    scope: ScopeKey,
    channel: ChannelTag,
    options: LimiterOptions,
    inner: Mutex<LimiterInner>,
    observer: Option<TransitionObserver>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("scope", &self.scope)
            .field("channel", &self.channel)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    pub fn new(scope: impl Into<ScopeKey>, options: LimiterOptions) -> Self {
        let scope = scope.into();
        let channel = options
            .channel
            .clone()
            .unwrap_or_else(|| ChannelTag::new(scope.provider()));
        let now = Instant::now();

        Self {
            inner: Mutex::new(LimiterInner {
                window: HybridWindow::new(&options, now),
                breaker: CircuitBreaker::new(&options),
                metrics: LimiterMetrics::default(),
            }),
            scope,
            channel,
            options,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: TransitionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    pub fn channel(&self) -> &ChannelTag {
        &self.channel
    }

    pub fn options(&self) -> &LimiterOptions {
        &self.options
    }

    fn announce(&self, change: Option<StateChange>) {
        let Some(StateChange { from, to }) = change else {
            return;
        };

        if to == CircuitState::Open {
            warn!("Circuit for {} moved {} -> {}", self.scope, from, to);
        } else {
            info!("Circuit for {} moved {} -> {}", self.scope, from, to);
        }

        if let Some(observer) = &self.observer {
            observer(&CircuitTransition {
                scope: self.scope.clone(),
                from,
                to,
            });
        }
    }

    /// Try to admit one call right now.
    ///
    /// An open circuit rejects without touching the bucket or the window.
    pub fn try_acquire(&self) -> AcquireResult {
        let now = Instant::now();

        let (result, change) = {
            let mut inner = self.inner.lock();
            let polled = inner.breaker.poll(now);
            let change = inner.note(polled);

            let result = if !inner.breaker.allows() {
                inner.metrics.record_circuit_rejection();
                AcquireResult {
                    allowed: false,
                    remaining: 0,
                    retry_after: Some(inner.breaker.retry_after(now)),
                    circuit_state: CircuitState::Open,
                    reason: Some(RejectReason::CircuitOpen),
                }
            } else {
                let circuit_state = inner.breaker.state();
                match inner.window.try_acquire(now) {
                    WindowOutcome::Admitted { remaining } => {
                        inner.metrics.record_allowed();
                        AcquireResult {
                            allowed: true,
                            remaining,
                            retry_after: None,
                            circuit_state,
                            reason: None,
                        }
                    }
                    WindowOutcome::Limited { retry_after } => {
                        inner.metrics.record_rate_limited(retry_after);
                        AcquireResult {
                            allowed: false,
                            remaining: 0,
                            retry_after: Some(retry_after),
                            circuit_state,
                            reason: Some(RejectReason::RateLimited),
                        }
                    }
                }
            };

            (result, change)
        };

        self.announce(change);

        match result.reason {
            Some(RejectReason::CircuitOpen) => {
                warn!("Rejected call on {}: circuit open", self.scope);
            }
            Some(RejectReason::RateLimited) => {
                debug!(
                    "Rate limited call on {}, retry after {:?}",
                    self.scope, result.retry_after
                );
            }
            None => {}
        }

        result
    }

    /// Report that an admitted call succeeded.
    pub fn record_success(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let change = inner.breaker.record_success();
            inner.note(change)
        };
        self.announce(change);
    }

    /// Report that an admitted call failed.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let change = {
            let mut inner = self.inner.lock();
            let change = inner.breaker.record_failure(now);
            inner.note(change)
        };
        self.announce(change);
    }

    async fn admit_within(&self, max_wait: Duration) -> Result<(), RejectReason> {
        let start = Instant::now();

        loop {
            let attempt = self.try_acquire();
            if attempt.allowed {
                return Ok(());
            }

            let reason = attempt.reason.unwrap_or(RejectReason::RateLimited);
            let elapsed = start.elapsed();
            if elapsed >= max_wait {
                return Err(reason);
            }

            let pause = attempt
                .retry_after
                .unwrap_or(FALLBACK_POLL_INTERVAL)
                .max(MIN_POLL_INTERVAL)
                .min(max_wait - elapsed);
            sleep(pause).await;
        }
    }

    /// Poll [`Self::try_acquire`] until admitted or `max_wait` has passed.
    ///
    /// Returns `false` on timeout. Dropping the future stops polling and
    /// cancels the pending sleep.
    pub async fn wait_and_acquire(&self, max_wait: Duration) -> bool {
        self.admit_within(max_wait).await.is_ok()
    }

    /// Wait for admission, run `f`, and report its outcome to the breaker.
    pub async fn call<F, Fut, T, E>(&self, max_wait: Duration, f: F) -> Result<T, GuardedCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.admit_within(max_wait).await {
            Ok(()) => {}
            Err(RejectReason::CircuitOpen) => return Err(GuardedCallError::CircuitOpen),
            Err(RejectReason::RateLimited) => return Err(GuardedCallError::Throttled),
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(GuardedCallError::Call(e))
            }
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.inner.lock().breaker.state()
    }

    pub fn get_metrics(&self) -> LimiterMetrics {
        self.inner.lock().metrics.clone()
    }

    pub fn get_state(&self) -> LimiterSnapshot {
        let inner = self.inner.lock();
        LimiterSnapshot {
            scope: self.scope.clone(),
            channel: self.channel.clone(),
            circuit_state: inner.breaker.state(),
            failure_count: inner.breaker.failure_count(),
            success_count: inner.breaker.success_count(),
            tokens: inner.window.tokens(),
            window_count: inner.window.window_count(),
            remaining: inner.window.remaining(),
            metrics: inner.metrics.clone(),
        }
    }
}
