//! Sliding-window admission control with a FIFO wait queue.
//!
//! At most `max_requests` admissions are recorded in any trailing `window`.
//! Callers that arrive while the window is full (or while others are already
//! waiting) take a ticket and suspend; tickets are granted strictly in
//! enqueue order.
//!
//! ```text
//! acquire ──▶ queue empty && slot free? ──yes──▶ record, grant
//!                    │no
//!                    ▼
//!             queue full? ──yes──▶ QueueFull
//!                    │no
//!                    ▼
//!             ticket ──▶ head: sleep_until(oldest + window) | notified
//!                        rest: notified
//! ```
//!
//! Window and queue share one mutex that is never held across an `.await`.
//! Dropping a waiting future removes its ticket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{Error, Result};

/// Admission limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Admissions allowed per window.
    pub max_requests: u32,

    /// Trailing window length.
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// Waiting callers allowed before `QueueFull`. `None` is unbounded.
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: Option<usize>,
}

fn default_max_queue_size() -> Option<usize> {
    Some(100)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(1),
            max_queue_size: default_max_queue_size(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(Error::validation("rate limit max_requests must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(Error::validation("rate limit window must be non-zero"));
        }
        Ok(())
    }
}

/// How a caller got through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Whether the caller had to wait in the queue.
    pub queued: bool,
    /// Time between the call to `acquire` and the grant.
    pub waited: Duration,
}

/// Point-in-time limiter snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitStats {
    pub current_requests: usize,
    pub max_requests: u32,
    pub utilization_percent: f64,
    pub queue_size: usize,
    pub max_queue_size: Option<usize>,
    pub can_execute_now: bool,
    /// Estimated wait for a caller arriving now, behind every queued ticket.
    /// Zero when `can_execute_now` holds, or when enough slots are free for
    /// the whole queue plus one more caller.
    #[serde(with = "humantime_serde")]
    pub next_available_in: Duration,
    pub next_available_at: DateTime<Utc>,
}

/// Sliding window of admission instants.
#[derive(Debug)]
struct SlidingWindow {
    timestamps: VecDeque<Instant>,
    window: Duration,
    max_requests: usize,
}

impl SlidingWindow {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            timestamps: VecDeque::with_capacity(config.max_requests.min(1024) as usize),
            window: config.window,
            max_requests: config.max_requests as usize,
        }
    }

    fn is_expired(&self, ts: Instant, now: Instant) -> bool {
        now.saturating_duration_since(ts) >= self.window
    }

    fn purge(&mut self, now: Instant) {
        while let Some(&ts) = self.timestamps.front() {
            if self.is_expired(ts, now) {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self) -> bool {
        self.timestamps.len() < self.max_requests
    }

    fn record(&mut self, now: Instant) {
        self.timestamps.push_back(now);
    }

    /// When the oldest recorded entry leaves the window.
    fn next_expiry(&self) -> Option<Instant> {
        self.timestamps.front().map(|&ts| ts + self.window)
    }

    /// Entries still inside the window at `now`, oldest first, without purging.
    fn live(&self, now: Instant) -> impl Iterator<Item = &Instant> + '_ {
        self.timestamps
            .iter()
            .filter(move |&&ts| !self.is_expired(ts, now))
    }
}

#[derive(Debug)]
struct Ticket {
    id: u64,
    enqueued_at: Instant,
}

#[derive(Debug)]
struct LimiterState {
    window: SlidingWindow,
    waiters: VecDeque<Ticket>,
    next_ticket: u64,
}

impl LimiterState {
    fn is_head(&self, id: u64) -> bool {
        self.waiters.front().is_some_and(|t| t.id == id)
    }
}

/// Sliding-window rate limiter shared by every caller of one backend.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
    notify: Notify,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let window = SlidingWindow::new(&config);
        Ok(Self {
            config,
            state: Mutex::new(LimiterState {
                window,
                waiters: VecDeque::new(),
                next_ticket: 0,
            }),
            notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` once admitted. Its output is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await?;
        Ok(operation().await)
    }

    /// Wait for an admission slot.
    ///
    /// Fails only with [`Error::QueueFull`]. Dropping the returned future
    /// while queued gives up the ticket.
    pub async fn acquire(&self) -> Result<Admission> {
        let started = Instant::now();

        let ticket_id = {
            let mut state = self.lock();
            state.window.purge(started);

            if state.waiters.is_empty() && state.window.has_capacity() {
                state.window.record(started);
                return Ok(Admission {
                    queued: false,
                    waited: Duration::ZERO,
                });
            }

            let queued = state.waiters.len();
            if let Some(max) = self.config.max_queue_size {
                if queued >= max {
                    tracing::warn!(queued, max, "rate limiter queue full, request rejected");
                    return Err(Error::QueueFull { queued, max });
                }
            }

            let id = state.next_ticket;
            state.next_ticket = state.next_ticket.wrapping_add(1);
            state.waiters.push_back(Ticket {
                id,
                enqueued_at: started,
            });
            tracing::debug!(ticket = id, position = queued + 1, "request queued by rate limiter");
            id
        };

        let mut ticket = TicketGuard {
            limiter: self,
            id: ticket_id,
            armed: true,
        };

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a grant in between is not missed.
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                let now = Instant::now();
                state.window.purge(now);
                let is_head = state.is_head(ticket_id);

                if is_head && state.window.has_capacity() {
                    let enqueued_at = state
                        .waiters
                        .pop_front()
                        .map_or(started, |t| t.enqueued_at);
                    state.window.record(now);
                    ticket.disarm();
                    drop(state);

                    // Followers may fit too when several entries expired together.
                    self.notify.notify_waiters();
                    let waited = now.saturating_duration_since(enqueued_at);
                    tracing::debug!(
                        ticket = ticket_id,
                        waited_ms = waited.as_millis() as u64,
                        "queued request admitted"
                    );
                    return Ok(Admission {
                        queued: true,
                        waited,
                    });
                }

                if is_head {
                    state.window.next_expiry()
                } else {
                    None
                }
            };

            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// [`acquire`](Self::acquire), abandoning the ticket when `cancel` fires.
    pub async fn acquire_with_cancel(&self, cancel: &CancellationToken) -> Result<Admission> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(Error::cancelled("cancelled while waiting for rate limit admission"))
            }
            admission = self.acquire() => admission,
        }
    }

    /// Number of callers currently waiting.
    pub fn queue_len(&self) -> usize {
        self.lock().waiters.len()
    }

    /// Snapshot of window usage. Does not purge.
    pub fn stats(&self) -> RateLimitStats {
        let state = self.lock();
        let now = Instant::now();
        let window = self.config.window;
        let current_requests = state.window.live(now).count();

        let max_requests = self.config.max_requests;
        let max = max_requests as usize;
        let free = max.saturating_sub(current_requests);
        let queue_size = state.waiters.len();

        // A new caller takes the slot after every queued ticket. Slots are
        // released as live entries expire, free slots are filled now, and each
        // release repeats one window later.
        let slots_ahead = (queue_size + 1).saturating_sub(free);
        let next_available_in = match slots_ahead.checked_sub(1) {
            None => Duration::ZERO,
            Some(k) => {
                let release = state
                    .window
                    .live(now)
                    .nth(k % max)
                    .map_or(now + window, |&ts| ts + window);
                let cycles = u32::try_from(k / max).unwrap_or(u32::MAX);
                release
                    .checked_add(window.saturating_mul(cycles))
                    .map_or(Duration::MAX, |at| at.saturating_duration_since(now))
            }
        };
        let next_available_at = Utc::now()
            + chrono::Duration::from_std(next_available_in)
                .unwrap_or_else(|_| chrono::Duration::zero());

        RateLimitStats {
            current_requests,
            max_requests,
            utilization_percent: current_requests as f64 / f64::from(max_requests) * 100.0,
            queue_size,
            max_queue_size: self.config.max_queue_size,
            can_execute_now: free > 0 && queue_size == 0,
            next_available_in,
            next_available_at,
        }
    }
}

/// Removes an abandoned ticket from the queue.
struct TicketGuard<'a> {
    limiter: &'a RateLimiter,
    id: u64,
    armed: bool,
}

impl TicketGuard<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let was_head = {
            let mut state = self.limiter.lock();
            let was_head = state.is_head(self.id);
            state.waiters.retain(|t| t.id != self.id);
            was_head
        };
        tracing::debug!(ticket = self.id, "queued request abandoned");
        if was_head {
            self.limiter.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready_ok, task};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn limiter(max: u32, window_ms: u64, queue: Option<usize>) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests: max,
            window: ms(window_ms),
            max_queue_size: queue,
        })
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_admits_then_waits() {
        let limiter = limiter(10, 1000, Some(10));
        let start = Instant::now();

        for _ in 0..10 {
            let admission = limiter.acquire().await.unwrap();
            assert!(!admission.queued);
        }
        let eleventh = limiter.acquire().await.unwrap();
        assert!(eleventh.queued);
        assert_eq!(eleventh.waited, ms(1000));
        assert_eq!(start.elapsed(), ms(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_window() {
        let limiter = limiter(2, 100, None);
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        assert!(!limiter.stats().can_execute_now);

        tokio::time::advance(ms(100)).await;
        assert!(limiter.stats().can_execute_now);
        assert!(!limiter.acquire().await.unwrap().queued);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_double_grant() {
        let limiter = limiter(3, 1000, None);
        let mut futures: Vec<_> = (0..8).map(|_| task::spawn(limiter.acquire())).collect();

        let mut granted = 0;
        for fut in futures.iter_mut() {
            if fut.poll().is_ready() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
        assert_eq!(limiter.queue_len(), 5);

        drop(futures);
        assert_eq!(limiter.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_caller_does_not_overtake_queue() {
        let limiter = limiter(1, 100, None);
        limiter.acquire().await.unwrap();

        let mut waiting = task::spawn(limiter.acquire());
        assert_pending!(waiting.poll());

        tokio::time::advance(ms(100)).await;
        // A slot is free but a ticket is queued ahead of the newcomer.
        let mut newcomer = task::spawn(limiter.acquire());
        assert_pending!(newcomer.poll());

        let admission = assert_ready_ok!(waiting.poll());
        assert!(admission.queued);
        assert_pending!(newcomer.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full() {
        let limiter = limiter(1, 1000, Some(1));
        limiter.acquire().await.unwrap();

        let mut first = task::spawn(limiter.acquire());
        assert_pending!(first.poll());

        let err = limiter.acquire().await.unwrap_err();
        assert!(matches!(err, Error::QueueFull { queued: 1, max: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_queue_rejects_when_full() {
        let limiter = limiter(1, 1000, Some(0));
        limiter.acquire().await.unwrap();
        assert!(matches!(
            limiter.acquire().await,
            Err(Error::QueueFull { queued: 0, max: 0 })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_removes_ticket() {
        let limiter = Arc::new(limiter(1, 1000, None));
        limiter.acquire().await.unwrap();
        let token = CancellationToken::new();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire_with_cancel(&token).await })
        };
        while limiter.queue_len() == 0 {
            tokio::task::yield_now().await;
        }

        token.cancel();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert_eq!(limiter.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_passes_output_through() {
        let limiter = limiter(1, 1000, None);
        let value = limiter.execute(|| async { 41 + 1 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats() {
        let limiter = limiter(4, 1000, Some(10));
        let empty = limiter.stats();
        assert_eq!(empty.current_requests, 0);
        assert!(empty.can_execute_now);
        assert_eq!(empty.next_available_in, Duration::ZERO);

        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let half = limiter.stats();
        assert_eq!(half.current_requests, 2);
        assert_eq!(half.utilization_percent, 50.0);
        assert!(half.can_execute_now);

        tokio::time::advance(ms(250)).await;
        limiter.acquire().await.unwrap();
        limiter.acquire().await.unwrap();
        let full = limiter.stats();
        assert_eq!(full.current_requests, 4);
        assert!(!full.can_execute_now);
        assert_eq!(full.next_available_in, ms(750));
        assert_eq!(full.max_queue_size, Some(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_wait_accounts_for_queued_tickets() {
        let limiter = limiter(1, 100, None);
        limiter.acquire().await.unwrap();
        let mut queued = task::spawn(limiter.acquire());
        assert_pending!(queued.poll());

        let behind_one = limiter.stats();
        assert_eq!(behind_one.queue_size, 1);
        assert!(!behind_one.can_execute_now);
        assert_eq!(behind_one.next_available_in, ms(200));

        // The entry has expired but the ticket has not been polled yet.
        tokio::time::advance(ms(100)).await;
        let slot_free = limiter.stats();
        assert_eq!(slot_free.current_requests, 0);
        assert!(!slot_free.can_execute_now);
        assert_eq!(slot_free.next_available_in, ms(100));

        assert_ready_ok!(queued.poll());
        let granted = limiter.stats();
        assert_eq!(granted.queue_size, 0);
        assert_eq!(granted.next_available_in, ms(100));
    }

    #[test]
    fn test_validation() {
        assert!(RateLimiter::new(RateLimitConfig::new(0, ms(100))).is_err());
        assert!(RateLimiter::new(RateLimitConfig::new(1, Duration::ZERO)).is_err());
        assert!(RateLimitConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_defaults_queue_size() {
        let cfg: RateLimitConfig =
            serde_json::from_str(r#"{"max_requests": 5, "window": "250ms"}"#).unwrap();
        assert_eq!(cfg.window, ms(250));
        assert_eq!(cfg.max_queue_size, Some(100));
    }
}
