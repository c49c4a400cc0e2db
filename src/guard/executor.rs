//! Retry executor - drives the attempt loop for one request.
//!
//! ```text
//! allow_request? ──no──▶ CircuitOpen { attempts: 0 }
//!      │
//!   attempt ──ok──▶ record_success ──▶ value
//!      │
//!     err ──▶ record_failure ──▶ decide ──deny──▶ Backend | CircuitOpen | RetriesExhausted
//!                                  │
//!                                retry ──▶ sleep(calculate_delay) ──▶ attempt + 1
//! ```
//!
//! Every backend failure is recorded before the retry decision. Cancellation
//! aborts the in-flight attempt or the wait and is never recorded.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::retry_policy::{DenyReason, RetryDecision, RetryPolicy};
use crate::types::{Error, Failure, RequestId, Result};

/// An outbound call the executor may run several times.
#[async_trait]
pub trait RetryableRequest: Send + Sync {
    type Output: Send;

    fn id(&self) -> &RequestId;

    fn description(&self) -> &str;

    /// Run one attempt.
    async fn execute(&self) -> std::result::Result<Self::Output, Failure>;
}

/// Adapts a closure returning a future into a [`RetryableRequest`].
pub struct RequestFn<F> {
    id: RequestId,
    description: String,
    operation: F,
}

impl<F> RequestFn<F> {
    pub fn new(description: impl Into<String>, operation: F) -> Self {
        Self {
            id: RequestId::new(),
            description: description.into(),
            operation,
        }
    }
}

impl<F> fmt::Debug for RequestFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestFn")
            .field("id", &self.id)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut, T> RetryableRequest for RequestFn<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<T, Failure>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn id(&self) -> &RequestId {
        &self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self) -> std::result::Result<T, Failure> {
        (self.operation)().await
    }
}

/// Runs requests under a shared [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    policy: Arc<RetryPolicy>,
}

impl RetryExecutor {
    pub fn new(policy: Arc<RetryPolicy>) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Arc<RetryPolicy> {
        &self.policy
    }

    pub async fn execute<R>(&self, request: &R) -> Result<R::Output>
    where
        R: RetryableRequest + ?Sized,
    {
        self.run(request, None).await
    }

    /// Like [`execute`](Self::execute), aborting when `cancel` fires.
    pub async fn execute_with_cancel<R>(
        &self,
        request: &R,
        cancel: &CancellationToken,
    ) -> Result<R::Output>
    where
        R: RetryableRequest + ?Sized,
    {
        self.run(request, Some(cancel)).await
    }

    async fn run<R>(&self, request: &R, cancel: Option<&CancellationToken>) -> Result<R::Output>
    where
        R: RetryableRequest + ?Sized,
    {
        let started = Instant::now();

        if !self.policy.allow_request() {
            tracing::warn!(
                request_id = %request.id(),
                request = request.description(),
                "circuit open, request rejected"
            );
            return Err(Error::CircuitOpen {
                attempts: 0,
                elapsed: Duration::ZERO,
                last: None,
            });
        }

        let mut attempt: u32 = 1;
        let mut previous_delay = None;

        loop {
            let outcome = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(cancelled(request, attempt)),
                    outcome = request.execute() => outcome,
                },
                None => request.execute().await,
            };

            let failure = match outcome {
                Ok(value) => {
                    self.policy.record_success(attempt);
                    if attempt > 1 {
                        tracing::info!(
                            request_id = %request.id(),
                            request = request.description(),
                            attempt,
                            "request recovered after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            self.policy.record_failure(&failure, attempt);
            let elapsed = started.elapsed();

            if let RetryDecision::Deny(reason) = self.policy.decide(&failure, attempt, elapsed) {
                return Err(denied(request, reason, failure, attempt, elapsed));
            }

            let delay = self
                .policy
                .calculate_delay(attempt, &failure, previous_delay);
            self.policy.record_retry_delay(delay);
            tracing::debug!(
                request_id = %request.id(),
                request = request.description(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying request"
            );

            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(cancelled(request, attempt)),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }

            previous_delay = Some(delay);
            attempt += 1;
        }
    }
}

fn cancelled<R: RetryableRequest + ?Sized>(request: &R, attempt: u32) -> Error {
    tracing::debug!(
        request_id = %request.id(),
        request = request.description(),
        attempt,
        "request cancelled"
    );
    Error::cancelled(format!(
        "{} cancelled during attempt {attempt}",
        request.description()
    ))
}

fn denied<R: RetryableRequest + ?Sized>(
    request: &R,
    reason: DenyReason,
    failure: Failure,
    attempts: u32,
    elapsed: Duration,
) -> Error {
    match reason {
        DenyReason::NotRetryable => {
            tracing::debug!(
                request_id = %request.id(),
                request = request.description(),
                error = %failure,
                "failure not retryable"
            );
            Error::Backend(failure)
        }
        DenyReason::CircuitOpen => {
            tracing::warn!(
                request_id = %request.id(),
                request = request.description(),
                attempts,
                error = %failure,
                "circuit open, retries abandoned"
            );
            Error::CircuitOpen {
                attempts,
                elapsed,
                last: Some(failure),
            }
        }
        DenyReason::MaxAttempts | DenyReason::MaxTotalTime => {
            tracing::warn!(
                request_id = %request.id(),
                request = request.description(),
                attempts,
                elapsed_ms = elapsed.as_millis() as u64,
                error = %failure,
                "retries exhausted"
            );
            Error::RetriesExhausted {
                attempts,
                elapsed,
                last: failure,
            }
        }
    }
}
