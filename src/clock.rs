//! Time source for the control loop.
//!
//! Every sleep and every timestamp the loop, the executor and the stall
//! detector use goes through [`Clock`], so tests can drive hours of loop time
//! without waiting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Monotonic + wall-clock time source with an awaitable sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Monotonic instant.
    fn now(&self) -> Instant;

    /// Wall-clock time, used for `captured_at` stamps.
    fn wall(&self) -> DateTime<Utc>;

    /// Suspend for `duration`.
    async fn sleep(&self, duration: Duration);

    /// Suspend until `deadline`. Returns immediately if it already passed.
    async fn sleep_until(&self, deadline: Instant) {
        let now = self.now();
        if deadline > now {
            self.sleep(deadline - now).await;
        }
    }

    /// Resolve once `budget` has run out while the caller waits on other work.
    async fn expire(&self, budget: Duration) {
        self.sleep(budget).await;
    }
}

/// Run `work` for at most `budget` of `clock` time. `None` if it ran out.
pub async fn timeout<F>(clock: &dyn Clock, budget: Duration, work: F) -> Option<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        out = work => Some(out),
        _ = clock.expire(budget) => None,
    }
}

/// Real time backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Polls a raced future gets before a manual deadline fires.
const MANUAL_EXPIRY_POLLS: usize = 32;

/// Manually advanced clock. `sleep` advances time instead of waiting.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    /// Total time advanced since creation.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    fn wall(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    /// Give the raced work a run of polls first, so work that finishes on its
    /// own manual sleeps wins, then jump past the budget.
    async fn expire(&self, budget: Duration) {
        for _ in 0..MANUAL_EXPIRY_POLLS {
            tokio::task::yield_now().await;
        }
        self.sleep(budget).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_clock_sleep_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        let wall_start = clock.wall();

        clock.sleep(Duration::from_secs(20)).await;

        assert_eq!(clock.now() - start, Duration::from_secs(20));
        assert_eq!((clock.wall() - wall_start).num_seconds(), 20);
    }

    #[tokio::test]
    async fn test_sleep_until_past_deadline_is_noop() {
        let clock = ManualClock::new();
        let deadline = clock.now();
        clock.advance(Duration::from_secs(5));

        clock.sleep_until(deadline).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(5));

        let later = clock.now() + Duration::from_secs(3);
        clock.sleep_until(later).await;
        assert_eq!(clock.elapsed(), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn test_timeout_gives_up_on_work_that_never_finishes() {
        let clock = ManualClock::new();

        let out = timeout(&clock, Duration::from_secs(2), std::future::pending::<u32>()).await;

        assert_eq!(out, None);
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_timeout_passes_through_finished_work() {
        let clock = ManualClock::new();

        let ready = timeout(&clock, Duration::from_secs(2), async { 7 }).await;
        assert_eq!(ready, Some(7));
        assert_eq!(clock.elapsed(), Duration::ZERO);

        let slow = timeout(&clock, Duration::from_secs(2), async {
            clock.sleep(Duration::from_millis(500)).await;
            8
        })
        .await;
        assert_eq!(slow, Some(8));
        assert_eq!(clock.elapsed(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_system_clock_timeout_uses_tokio_timers() {
        let started = Instant::now();
        let budget = Duration::from_millis(20);
        let out = timeout(&SystemClock, budget, std::future::pending::<()>()).await;

        assert!(out.is_none());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
