//! Circuit breaker state machine.
//!
//! Allowed transitions: closed → open, open → half_open, half_open → closed,
//! half_open → open.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ratelimit::LimiterOptions;
use crate::types::ScopeKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change on one scope, reported to observers and logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub scope: ScopeKey,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateChange {
    pub(crate) from: CircuitState,
    pub(crate) to: CircuitState,
}

#[derive(Debug)]
pub(crate) struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    failure_threshold: u32,
    reset_timeout: Duration,
    success_threshold: u32,
}

impl CircuitBreaker {
    pub(crate) fn new(options: &LimiterOptions) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure: None,
            failure_threshold: options.failure_threshold.max(1),
            reset_timeout: options.reset_timeout(),
            success_threshold: options.success_threshold.max(1),
        }
    }

    fn transition(&mut self, to: CircuitState) -> Option<StateChange> {
        let from = self.state;
        if from == to {
            return None;
        }
        self.state = to;
        match to {
            CircuitState::Closed => {
                self.failure_count = 0;
                self.success_count = 0;
            }
            CircuitState::Open | CircuitState::HalfOpen => self.success_count = 0,
        }
        Some(StateChange { from, to })
    }

    /// Move an open breaker to half-open once the reset timeout has passed.
    pub(crate) fn poll(&mut self, now: Instant) -> Option<StateChange> {
        if self.state == CircuitState::Open && self.retry_after(now).is_zero() {
            return self.transition(CircuitState::HalfOpen);
        }
        None
    }

    /// Whether an attempt may pass. Call [`Self::poll`] first.
    pub(crate) fn allows(&self) -> bool {
        self.state != CircuitState::Open
    }

    /// Time left before an open breaker starts probing.
    pub(crate) fn retry_after(&self, now: Instant) -> Duration {
        match (self.state, self.last_failure) {
            (CircuitState::Open, Some(last)) => {
                (last + self.reset_timeout).saturating_duration_since(now)
            }
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn record_success(&mut self) -> Option<StateChange> {
        match self.state {
            CircuitState::Closed => {
                self.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                self.success_count = self.success_count.saturating_add(1);
                if self.success_count >= self.success_threshold {
                    self.transition(CircuitState::Closed)
                } else {
                    None
                }
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => None,
        }
    }

    pub(crate) fn record_failure(&mut self, now: Instant) -> Option<StateChange> {
        self.last_failure = Some(now);
        match self.state {
            CircuitState::Closed => {
                self.failure_count = self.failure_count.saturating_add(1);
                if self.failure_count >= self.failure_threshold {
                    self.transition(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count = self.failure_count.saturating_add(1);
                self.transition(CircuitState::Open)
            }
            CircuitState::Open => {
                self.failure_count = self.failure_count.saturating_add(1);
                None
            }
        }
    }

    pub(crate) fn state(&self) -> CircuitState {
        self.state
    }

    pub(crate) fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub(crate) fn success_count(&self) -> u32 {
        self.success_count
    }
}
