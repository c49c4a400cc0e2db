//! Admission integration tests: window, FIFO order, queue bounds, cancellation.

use apiguard_core::guard::{RateLimitConfig, RateLimiter};
use apiguard_core::Error;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn limiter(max_requests: u32, window: Duration, max_queue_size: Option<usize>) -> Arc<RateLimiter> {
    Arc::new(
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window,
            max_queue_size,
        })
        .unwrap(),
    )
}

/// Helper: wait until the limiter reports `n` queued callers.
async fn wait_for_queue(limiter: &RateLimiter, n: usize) {
    while limiter.queue_len() != n {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_eleventh_request_waits_for_first_to_age_out() {
    let limiter = limiter(10, ms(1000), Some(100));
    let start = Instant::now();

    for i in 0..10 {
        // Spread admissions across the window.
        tokio::time::sleep(ms(10)).await;
        let admission = limiter.acquire().await.unwrap();
        assert!(!admission.queued, "admission {i} should be immediate");
    }
    let eleventh = limiter.acquire().await.unwrap();

    assert!(eleventh.queued);
    // First entry was recorded at 10ms.
    assert_eq!(start.elapsed(), ms(1010));
}

#[tokio::test(start_paused = true)]
async fn test_waiters_resume_in_fifo_order() {
    let limiter = limiter(2, ms(100), Some(10));
    limiter.acquire().await.unwrap();
    limiter.acquire().await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for i in 0..6 {
        let waiter = Arc::clone(&limiter);
        let order = Arc::clone(&order);
        // Earlier waiters run longer, so completion order differs from
        // admission order.
        let work = ms(30 * (6 - i as u64));
        handles.push(tokio::spawn(async move {
            waiter
                .execute(|| async move {
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(work).await;
                })
                .await
                .unwrap();
        }));
        wait_for_queue(&limiter, i + 1).await;
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(limiter.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_several_expiries_grant_several_waiters_together() {
    let limiter = limiter(3, ms(100), None);
    for _ in 0..3 {
        limiter.acquire().await.unwrap();
    }

    let start = Instant::now();
    let handles: Vec<_> = (0..3)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await.unwrap() })
        })
        .collect();

    for handle in handles {
        let admission = handle.await.unwrap();
        assert!(admission.queued);
    }
    // All three entries expired at the same instant.
    assert_eq!(start.elapsed(), ms(100));
}

#[tokio::test(start_paused = true)]
async fn test_queue_full_fails_fast() {
    let limiter = limiter(1, ms(1000), Some(2));
    limiter.acquire().await.unwrap();

    let waiters: Vec<_> = (0..2)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await })
        })
        .collect();
    wait_for_queue(&limiter, 2).await;

    let started = Instant::now();
    let err = limiter.acquire().await.unwrap_err();
    assert!(matches!(err, Error::QueueFull { queued: 2, max: 2 }));
    assert_eq!(started.elapsed(), Duration::ZERO);

    for waiter in waiters {
        assert!(waiter.await.unwrap().unwrap().queued);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_head_lets_next_waiter_through() {
    let limiter = limiter(1, ms(100), None);
    limiter.acquire().await.unwrap();

    let token = CancellationToken::new();
    let head = {
        let limiter = Arc::clone(&limiter);
        let token = token.clone();
        tokio::spawn(async move { limiter.acquire_with_cancel(&token).await })
    };
    wait_for_queue(&limiter, 1).await;

    let next = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire().await })
    };
    wait_for_queue(&limiter, 2).await;

    token.cancel();
    assert!(matches!(head.await.unwrap(), Err(Error::Cancelled(_))));

    let start = Instant::now();
    let admission = next.await.unwrap().unwrap();
    assert!(admission.queued);
    assert!(start.elapsed() <= ms(100));
    assert_eq!(limiter.queue_len(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_drops_ticket() {
    let limiter = limiter(1, ms(1000), None);
    limiter.acquire().await.unwrap();

    let result = tokio::time::timeout(ms(50), limiter.acquire()).await;
    assert!(result.is_err());
    assert_eq!(limiter.queue_len(), 0);

    // The abandoned ticket does not hold up later callers.
    tokio::time::sleep(ms(950)).await;
    assert!(!limiter.acquire().await.unwrap().queued);
}

#[tokio::test(start_paused = true)]
async fn test_stats_reflect_queue() {
    let limiter = limiter(1, ms(500), Some(5));
    limiter.acquire().await.unwrap();

    let waiter = {
        let limiter = Arc::clone(&limiter);
        tokio::spawn(async move { limiter.acquire().await })
    };
    wait_for_queue(&limiter, 1).await;

    let stats = limiter.stats();
    assert_eq!(stats.current_requests, 1);
    assert_eq!(stats.queue_size, 1);
    assert_eq!(stats.utilization_percent, 100.0);
    assert!(!stats.can_execute_now);
    // The queued ticket takes the slot freed at 500ms.
    assert_eq!(stats.next_available_in, ms(1000));

    waiter.await.unwrap().unwrap();
    assert_eq!(limiter.stats().queue_size, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_never_exceed_window() {
    let limiter = limiter(5, ms(200), None);
    let granted_at = Arc::new(Mutex::new(Vec::new()));

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let granted_at = Arc::clone(&granted_at);
            tokio::spawn(async move {
                limiter.acquire().await.unwrap();
                granted_at.lock().unwrap().push(Instant::now());
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let mut times = granted_at.lock().unwrap().clone();
    times.sort();
    assert_eq!(times.len(), 20);
    // Any six consecutive grants span (nearly) a full window.
    for pair in times.windows(6) {
        assert!(pair[5].duration_since(pair[0]) >= ms(150));
    }
}
