//! Outbound admission control for messaging providers.
//!
//! Each scope key (`provider:account:global`, `...:group:<chat>`,
//! `...:dm:<chat>`) gets a [`RateLimiter`]: a circuit breaker checked
//! first, then a token bucket backed by a sliding window. Callers report
//! the outcome of every admitted call with `record_success` or
//! `record_failure`; the limiter never observes the I/O itself.
//!
//! ```ignore
//! let registry = LimiterRegistry::new(config.rate_limits.clone());
//! let limiter = registry.for_conversation("telegram", "default", &ConversationScope::Dm(chat_id));
//!
//! if !limiter.wait_and_acquire(DEFAULT_MAX_WAIT).await {
//!     return Err(anyhow!("send deferred: {:?}", limiter.circuit_state()));
//! }
//! match send(&message).await {
//!     Ok(_) => limiter.record_success(),
//!     Err(_) => limiter.record_failure(),
//! }
//! ```
//!
//! State is per process; separate gateway instances do not share budgets.

mod breaker;
mod limiter;
mod metrics;
mod registry;
mod window;

pub use breaker::{CircuitState, CircuitTransition};
pub use limiter::{
    AcquireResult, DEFAULT_MAX_WAIT, GuardedCallError, LimiterOptions, LimiterSnapshot,
    RateLimiter, RejectReason, TransitionObserver,
};
pub use metrics::{AggregatedMetrics, LimiterMetrics};
pub use registry::{ConversationScope, LimiterRegistry, ProviderLimits, RateLimitDefaults};
