//! Circuit breaker state machine.
//!
//! # State Transitions
//! ```text
//! Closed   → Open:     consecutive failures >= failure_threshold
//! Open     → HalfOpen: recovery_timeout elapsed (checked lazily)
//! HalfOpen → Closed:   consecutive successes >= half_open_success_threshold
//! HalfOpen → Open:     any failure
//! ```
//!
//! NOT thread-safe on its own - owned by [`RetryPolicy`](super::retry_policy::RetryPolicy)
//! behind the same lock as the metrics, and called via `&mut self`. Every
//! method takes `now` so tests can drive time explicitly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

use crate::types::{Error, Result};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Backend assumed down; calls and retries are refused.
    Open,
    /// Probing recovery; calls flow through, one failure re-opens.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Disabled breakers never leave `Closed`.
    pub enabled: bool,

    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,

    /// Time spent open before probing.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Consecutive half-open successes that close the circuit.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.failure_threshold == 0 {
            return Err(Error::validation(
                "circuit breaker failure_threshold must be at least 1",
            ));
        }
        if self.half_open_success_threshold == 0 {
            return Err(Error::validation(
                "circuit breaker half_open_success_threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

/// A state change caused by a breaker operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Transitions caused by one recorded result, oldest first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transitions([Option<Transition>; 2]);

impl Transitions {
    fn push(&mut self, transition: Option<Transition>) {
        let Some(transition) = transition else {
            return;
        };
        if let Some(slot) = self.0.iter_mut().find(|slot| slot.is_none()) {
            *slot = Some(transition);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0[0].is_none()
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// The transition that produced the resulting state.
    pub fn last(&self) -> Option<Transition> {
        self.iter().last()
    }

    pub fn iter(&self) -> impl Iterator<Item = Transition> + '_ {
        self.0.iter().flatten().copied()
    }
}

/// Circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    transitions: u64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
            transitions: 0,
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// State as last recorded, without applying the lazy recovery check.
    pub fn current_state(&self) -> CircuitState {
        self.state
    }

    /// State at `now`, moving `Open` to `HalfOpen` if the recovery timeout
    /// has elapsed.
    pub fn state(&mut self, now: Instant) -> (CircuitState, Option<Transition>) {
        let transition = self.refresh(now);
        (self.state, transition)
    }

    /// False while the circuit is open and the recovery timeout is unexpired.
    pub fn allows_request(&mut self, now: Instant) -> (bool, Option<Transition>) {
        let transition = self.refresh(now);
        (self.state != CircuitState::Open, transition)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Total number of state transitions since construction.
    pub fn transitions(&self) -> u64 {
        self.transitions
    }

    /// State at `now` without applying the lazy recovery check's side effects.
    pub fn effective_state(&self, now: Instant) -> CircuitState {
        match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened_at))
                if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout =>
            {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Records a successful call. An expired `Open` circuit moves to
    /// `HalfOpen` first, so up to two transitions can come back.
    pub fn record_success(&mut self, now: Instant) -> Transitions {
        let mut transitions = Transitions::default();
        if !self.config.enabled {
            return transitions;
        }
        transitions.push(self.refresh(now));
        self.consecutive_failures = 0;

        if self.state == CircuitState::HalfOpen {
            self.half_open_successes += 1;
            if self.half_open_successes >= self.config.half_open_success_threshold {
                transitions.push(Some(self.move_to(CircuitState::Closed, now)));
            }
        }
        transitions
    }

    /// Records a failed call. Same ordering as [`record_success`](Self::record_success).
    pub fn record_failure(&mut self, now: Instant) -> Transitions {
        let mut transitions = Transitions::default();
        if !self.config.enabled {
            return transitions;
        }
        transitions.push(self.refresh(now));
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match self.state {
            CircuitState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    transitions.push(Some(self.move_to(CircuitState::Open, now)));
                }
            }
            CircuitState::HalfOpen => {
                transitions.push(Some(self.move_to(CircuitState::Open, now)));
            }
            // Late result from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
        transitions
    }

    fn refresh(&mut self, now: Instant) -> Option<Transition> {
        if self.state != CircuitState::Open {
            return None;
        }
        let opened_at = self.opened_at?;
        if now.saturating_duration_since(opened_at) >= self.config.recovery_timeout {
            return Some(self.move_to(CircuitState::HalfOpen, now));
        }
        None
    }

    fn move_to(&mut self, to: CircuitState, now: Instant) -> Transition {
        let from = self.state;
        self.state = to;
        self.transitions += 1;
        match to {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.half_open_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = 0;
            }
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.half_open_successes = 0;
                self.opened_at = None;
            }
        }
        Transition { from, to }
    }
}
