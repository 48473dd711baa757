use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-bot gate that blocks recovery attempts after repeated failures.
///
/// Time is passed in explicitly so callers decide which clock drives the
/// cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    #[must_use]
    pub const fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            threshold,
            timeout,
        }
    }

    /// Current state, moving OPEN to HALF_OPEN once the timeout has elapsed
    /// since the last failure.
    pub fn check(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            let cooled = self
                .last_failure
                .map_or(true, |at| now.saturating_duration_since(at) >= self.timeout);
            if cooled {
                self.state = CircuitState::HalfOpen;
                tracing::debug!("Circuit breaker half-open after {:?}", self.timeout);
            }
        }
        self.state
    }

    /// Whether a recovery attempt may run.
    pub fn allows(&mut self, now: Instant) -> bool {
        self.check(now) != CircuitState::Open
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.failure_count += 1;
        self.last_failure = Some(now);

        let trip = self.state == CircuitState::HalfOpen || self.failure_count >= self.threshold;
        if trip && self.state != CircuitState::Open {
            tracing::warn!(
                "Circuit breaker opened after {} failures",
                self.failure_count
            );
            self.state = CircuitState::Open;
        }
    }

    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.last_failure = None;
    }

    #[must_use]
    pub const fn state(&self) -> CircuitState {
        self.state
    }

    #[must_use]
    pub const fn failure_count(&self) -> u32 {
        self.failure_count
    }
}
