//! Gateway admission control.
//!
//! Two halves:
//! - [`auth`]: decides whether an incoming control-plane connection is
//!   admitted (shared secret, verified Tailscale identity, or opt-in
//!   trusted localhost).
//! - [`ratelimit`]: decides whether an outbound provider call may go out
//!   now (circuit breaker plus hybrid token bucket / sliding window).

pub mod auth;
pub mod config;
pub mod ratelimit;
pub mod server;
pub mod types;

pub use auth::{AuthDecision, AuthMethod, Credentials, ReasonCode, RequestFacts, authorize};
pub use config::{GatewayConfig, load_gateway_config};
pub use ratelimit::{
    AcquireResult, CircuitState, ConversationScope, LimiterOptions, LimiterRegistry, RateLimiter,
};
pub use server::{AuthSession, GatewayState, SessionOrigin, create_router, start_gateway};
pub use types::{ChannelTag, ScopeKey, UserLogin};
