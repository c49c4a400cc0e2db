//! Guard - admission control plus retry around one backend.
//!
//! The limiter and the retry policy are plain structs shared through `Arc`.
//! A `Guard` admits a call through the limiter once, then hands it to the
//! retry executor. Retries do not re-enter the admission queue.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::types::{Config, Error, Result};

pub mod backoff;
pub mod circuit_breaker;
pub mod executor;
pub mod random;
pub mod rate_limiter;
pub mod retry_policy;

pub use backoff::{BackoffConfig, BackoffKind, JitterConfig, JitterKind};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Transition, Transitions,
};
pub use executor::{RequestFn, RetryExecutor, RetryableRequest};
pub use random::{FixedRandom, RandomSource, SeededRandom, ThreadRandom};
pub use rate_limiter::{Admission, RateLimitConfig, RateLimitStats, RateLimiter};
pub use retry_policy::{
    DenyReason, RetryCondition, RetryDecision, RetryMetrics, RetryPolicy, RetryPolicyConfig,
    RetryPreset,
};

/// Rate limiter and retry executor for one backend.
#[derive(Debug, Clone)]
pub struct Guard {
    limiter: Arc<RateLimiter>,
    executor: RetryExecutor,
}

impl Guard {
    pub fn new(limiter: Arc<RateLimiter>, policy: Arc<RetryPolicy>) -> Self {
        Self {
            limiter,
            executor: RetryExecutor::new(policy),
        }
    }

    /// Build both components from a validated [`Config`].
    pub fn from_config(config: &Config) -> Result<Self> {
        let limiter = RateLimiter::new(config.rate_limit.clone())?;
        let policy = RetryPolicy::new(config.retry.clone().into_config())?;
        Ok(Self::new(Arc::new(limiter), Arc::new(policy)))
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        self.executor.policy()
    }

    pub async fn execute<R>(&self, request: &R) -> Result<R::Output>
    where
        R: RetryableRequest + ?Sized,
    {
        self.limiter.acquire().await?;
        self.executor.execute(request).await
    }

    /// Cancelling aborts queueing, the in-flight attempt, or a retry wait.
    pub async fn execute_with_cancel<R>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<R::Output>
    where
        R: RetryableRequest + ?Sized,
    {
        self.limiter.acquire_with_cancel(cancel).await?;
        self.executor.execute_with_cancel(request, cancel).await
    }

    /// Bound queueing and every attempt by `timeout`.
    ///
    /// On expiry the in-flight attempt is dropped without being recorded.
    pub async fn execute_with_timeout<R>(&self, request: &R, timeout: Duration) -> Result<R::Output>
    where
        R: RetryableRequest + ?Sized,
    {
        match tokio::time::timeout(timeout, self.execute(request)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    request_id = %request.id(),
                    request = request.description(),
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(Error::Timeout(timeout))
            }
        }
    }

    pub fn stats(&self) -> RateLimitStats {
        self.limiter.stats()
    }

    pub fn metrics(&self) -> RetryMetrics {
        self.executor.policy().metrics()
    }
}
