//! Retry policy: classification, delay calculation, breaker and metrics.
//!
//! # Decision order
//! ```text
//! attempt >= max_attempts        → Deny(MaxAttempts)
//! elapsed >= max_total_time      → Deny(MaxTotalTime)
//! category/status not retryable  → Deny(NotRetryable)
//! circuit open (timeout pending) → Deny(CircuitOpen)
//! otherwise                      → Retry
//! ```
//!
//! Circuit state and metrics live behind one mutex, so a recording updates
//! both atomically and concurrent callers crossing the failure threshold open
//! the circuit exactly once. The lock is never held across an `.await`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use super::backoff::{BackoffConfig, JitterConfig, JitterKind};
use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition};
use super::random::{RandomSource, ThreadRandom};
use crate::types::{Error, Failure, FailureCategory, Result};

/// When a failure may be retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryCondition {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Budget measured from the first attempt.
    #[serde(with = "humantime_serde")]
    pub max_total_time: Duration,

    pub retryable_status_codes: Vec<u16>,

    pub retryable_error_types: Vec<FailureCategory>,
}

impl Default for RetryCondition {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_total_time: Duration::from_secs(60),
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
            retryable_error_types: vec![FailureCategory::Network, FailureCategory::RateLimit],
        }
    }
}

/// Immutable retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub backoff: BackoffConfig,

    pub jitter: JitterConfig,

    pub condition: RetryCondition,

    /// Omitted in config files means no breaker.
    #[serde(default = "CircuitBreakerConfig::disabled")]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default = "default_enable_metrics")]
    pub enable_metrics: bool,
}

fn default_enable_metrics() -> bool {
    true
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self::production()
    }
}

impl RetryPolicyConfig {
    /// Short waits, a tolerant breaker.
    pub fn development() -> Self {
        Self {
            backoff: BackoffConfig::exponential(
                Duration::from_millis(500),
                Duration::from_secs(10),
                2.0,
            ),
            jitter: JitterConfig::new(JitterKind::Equal),
            condition: RetryCondition {
                max_attempts: 3,
                max_total_time: Duration::from_secs(30),
                ..RetryCondition::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 10,
                recovery_timeout: Duration::from_secs(30),
                half_open_success_threshold: 1,
            },
            enable_metrics: true,
        }
    }

    /// Deterministic and fast: fixed delay, no jitter, no breaker.
    pub fn testing() -> Self {
        Self {
            backoff: BackoffConfig::fixed(Duration::from_millis(10)),
            jitter: JitterConfig::none(),
            condition: RetryCondition {
                max_attempts: 2,
                max_total_time: Duration::from_secs(5),
                ..RetryCondition::default()
            },
            circuit_breaker: CircuitBreakerConfig::disabled(),
            enable_metrics: true,
        }
    }

    /// Exponential backoff with full jitter and an active breaker.
    pub fn production() -> Self {
        Self {
            backoff: BackoffConfig::exponential(
                Duration::from_secs(1),
                Duration::from_secs(30),
                2.0,
            ),
            jitter: JitterConfig::new(JitterKind::Full),
            condition: RetryCondition {
                max_attempts: 5,
                max_total_time: Duration::from_secs(120),
                ..RetryCondition::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                enabled: true,
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
                half_open_success_threshold: 2,
            },
            enable_metrics: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.condition.max_attempts == 0 {
            return Err(Error::validation("retry max_attempts must be at least 1"));
        }
        self.backoff.validate()?;
        self.jitter.validate()?;
        self.circuit_breaker.validate()
    }
}

/// Named retry parameter sets, or a caller-built configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPreset {
    Development,
    Testing,
    #[default]
    Production,
    Custom(RetryPolicyConfig),
}

impl RetryPreset {
    pub fn into_config(self) -> RetryPolicyConfig {
        match self {
            RetryPreset::Development => RetryPolicyConfig::development(),
            RetryPreset::Testing => RetryPolicyConfig::testing(),
            RetryPreset::Production => RetryPolicyConfig::production(),
            RetryPreset::Custom(config) => config,
        }
    }

    /// Parse a preset name (`development`, `testing`, `production`).
    pub fn from_name(name: &str) -> Result<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(RetryPreset::Development),
            "testing" | "test" => Ok(RetryPreset::Testing),
            "production" | "prod" => Ok(RetryPreset::Production),
            other => Err(Error::validation(format!("unknown retry preset: {other}"))),
        }
    }
}

/// Why a retry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    MaxAttempts,
    MaxTotalTime,
    NotRetryable,
    CircuitOpen,
}

/// Outcome of a retry evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Deny(DenyReason),
}

impl RetryDecision {
    pub fn is_retry(self) -> bool {
        matches!(self, RetryDecision::Retry)
    }
}

/// Snapshot of retry metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryMetrics {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    #[serde(with = "humantime_serde")]
    pub total_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub average_retry_delay: Duration,
    pub circuit_state: CircuitState,
    pub circuit_transitions: u64,
    pub last_failure: Option<Failure>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    total_attempts: u64,
    successful_retries: u64,
    failed_retries: u64,
    total_retry_delay: Duration,
    retry_delays: u32,
    circuit_transitions: u64,
    last_failure: Option<Failure>,
    last_failure_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct PolicyState {
    breaker: CircuitBreaker,
    metrics: MetricsCounters,
}

/// Retry policy shared by every call to one backend.
#[derive(Debug)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
    rng: Arc<dyn RandomSource>,
    state: Mutex<PolicyState>,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Result<Self> {
        Self::with_random_source(config, Arc::new(ThreadRandom))
    }

    pub fn from_preset(preset: RetryPreset) -> Result<Self> {
        Self::new(preset.into_config())
    }

    /// Build with an explicit random source (seeded or fixed for tests).
    pub fn with_random_source(
        config: RetryPolicyConfig,
        rng: Arc<dyn RandomSource>,
    ) -> Result<Self> {
        config.validate()?;
        let breaker = CircuitBreaker::new(config.circuit_breaker.clone());
        Ok(Self {
            config,
            rng,
            state: Mutex::new(PolicyState {
                breaker,
                metrics: MetricsCounters::default(),
            }),
        })
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PolicyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Category in `retryable_error_types` or status in `retryable_status_codes`.
    pub fn is_retryable(&self, failure: &Failure) -> bool {
        let condition = &self.config.condition;
        condition
            .retryable_error_types
            .contains(&failure.category())
            || failure
                .status_code()
                .is_some_and(|status| condition.retryable_status_codes.contains(&status))
    }

    /// Evaluate whether `failure` on `attempt` (1-based) may be retried.
    pub fn decide(&self, failure: &Failure, attempt: u32, elapsed: Duration) -> RetryDecision {
        let condition = &self.config.condition;
        if attempt >= condition.max_attempts {
            return RetryDecision::Deny(DenyReason::MaxAttempts);
        }
        if elapsed >= condition.max_total_time {
            return RetryDecision::Deny(DenyReason::MaxTotalTime);
        }
        if !self.is_retryable(failure) {
            return RetryDecision::Deny(DenyReason::NotRetryable);
        }
        if !self.allow_request() {
            return RetryDecision::Deny(DenyReason::CircuitOpen);
        }
        RetryDecision::Retry
    }

    pub fn should_retry(&self, failure: &Failure, attempt: u32, elapsed: Duration) -> bool {
        self.decide(failure, attempt, elapsed).is_retry()
    }

    /// False while the circuit is open and its recovery timeout is pending.
    pub fn allow_request(&self) -> bool {
        let mut state = self.lock();
        let (allowed, transition) = state.breaker.allows_request(Instant::now());
        if let Some(transition) = transition {
            note_transition(&mut state, transition);
        }
        allowed
    }

    /// Circuit state at this instant, applying the lazy recovery check.
    pub fn circuit_state(&self) -> CircuitState {
        let mut state = self.lock();
        let (current, transition) = state.breaker.state(Instant::now());
        if let Some(transition) = transition {
            note_transition(&mut state, transition);
        }
        current
    }

    /// Delay before the attempt following `attempt`.
    ///
    /// `previous` is the delay this operation waited last time, if any.
    pub fn calculate_delay(
        &self,
        attempt: u32,
        failure: &Failure,
        previous: Option<Duration>,
    ) -> Duration {
        let base = self.config.backoff.base_delay(attempt);
        let delay = self
            .config
            .jitter
            .apply(base, previous, &self.config.backoff, self.rng.as_ref());
        failure
            .suggested_delay()
            .filter(|hint| *hint > delay)
            .unwrap_or(delay)
    }

    pub fn record_success(&self, attempt: u32) {
        let mut state = self.lock();
        let transitions = state.breaker.record_success(Instant::now());
        for transition in transitions.iter() {
            note_transition(&mut state, transition);
        }
        if self.config.enable_metrics {
            state.metrics.total_attempts += 1;
            if attempt > 1 {
                state.metrics.successful_retries += 1;
            }
        }
    }

    pub fn record_failure(&self, failure: &Failure, attempt: u32) {
        let mut state = self.lock();
        let transitions = state.breaker.record_failure(Instant::now());
        for transition in transitions.iter() {
            note_transition(&mut state, transition);
        }
        if self.config.enable_metrics {
            let metrics = &mut state.metrics;
            metrics.total_attempts += 1;
            if attempt > 1 {
                metrics.failed_retries += 1;
            }
            metrics.last_failure = Some(failure.clone());
            metrics.last_failure_at = Some(Utc::now());
        }
    }

    /// Account for a wait scheduled between attempts.
    pub fn record_retry_delay(&self, delay: Duration) {
        if !self.config.enable_metrics {
            return;
        }
        let mut state = self.lock();
        state.metrics.total_retry_delay += delay;
        state.metrics.retry_delays = state.metrics.retry_delays.saturating_add(1);
    }

    /// Snapshot of counters and the circuit state as the next request
    /// would see it. Does not apply the recovery transition.
    pub fn metrics(&self) -> RetryMetrics {
        let state = self.lock();
        let m = &state.metrics;
        let average_retry_delay = if m.retry_delays == 0 {
            Duration::ZERO
        } else {
            m.total_retry_delay / m.retry_delays
        };
        RetryMetrics {
            total_attempts: m.total_attempts,
            successful_retries: m.successful_retries,
            failed_retries: m.failed_retries,
            total_retry_delay: m.total_retry_delay,
            average_retry_delay,
            circuit_state: state.breaker.effective_state(Instant::now()),
            circuit_transitions: m.circuit_transitions,
            last_failure: m.last_failure.clone(),
            last_failure_at: m.last_failure_at,
        }
    }

    /// Zero all counters. Circuit state is untouched.
    pub fn reset_metrics(&self) {
        self.lock().metrics = MetricsCounters::default();
    }
}

fn note_transition(state: &mut PolicyState, transition: Transition) {
    state.metrics.circuit_transitions = state.metrics.circuit_transitions.saturating_add(1);
    let failures = state.breaker.consecutive_failures();
    match transition.to {
        CircuitState::Open => tracing::warn!(
            from = %transition.from,
            consecutive_failures = failures,
            "circuit breaker opened"
        ),
        CircuitState::HalfOpen => tracing::info!(
            from = %transition.from,
            "circuit breaker half-open, probing backend"
        ),
        CircuitState::Closed => tracing::info!(
            from = %transition.from,
            "circuit breaker closed, backend recovered"
        ),
    }
}
