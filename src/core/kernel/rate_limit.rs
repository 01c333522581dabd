use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

/// Calls per second allowed by the venue for both queries and orders
pub const DEFAULT_CALLS_PER_SECOND: usize = 5;

/// Rolling-window call limiter shared by every outbound REST call
///
/// The limiter keeps the admission time of every call still inside the window.
/// A caller that finds the window full waits until the oldest entry ages out;
/// callers are admitted in the order they reached the limiter because the
/// window lock is FIFO-fair and held across that wait.
#[derive(Debug)]
pub struct RateLimiter {
    max_calls: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_calls` per rolling `window`
    ///
    /// # Arguments
    /// * `max_calls` - Maximum admissions inside any window, at least 1
    /// * `window` - Length of the rolling window
    pub fn new(max_calls: usize, window: Duration) -> Self {
        let max_calls = max_calls.max(1);
        Self {
            max_calls,
            window,
            calls: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    /// Limiter admitting `calls` per rolling second
    pub fn per_second(calls: usize) -> Self {
        Self::new(calls, Duration::from_secs(1))
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Wait for a free slot in the window and reserve it
    ///
    /// The slot is never released explicitly; it expires once the window has
    /// elapsed since admission.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;
        loop {
            let now = Instant::now();
            while calls
                .front()
                .is_some_and(|admitted| now.duration_since(*admitted) >= self.window)
            {
                calls.pop_front();
            }

            if calls.len() < self.max_calls {
                calls.push_back(now);
                return;
            }

            if let Some(oldest) = calls.front().copied() {
                let ready_at = oldest + self.window;
                trace!(
                    wait_ms = ready_at.saturating_duration_since(now).as_millis() as u64,
                    "rate window full"
                );
                sleep_until(ready_at).await;
            }
        }
    }

    /// Number of admissions still inside the window
    pub async fn in_window(&self) -> usize {
        let calls = self.calls.lock().await;
        let now = Instant::now();
        calls
            .iter()
            .filter(|admitted| now.duration_since(**admitted) < self.window)
            .count()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::per_second(DEFAULT_CALLS_PER_SECOND)
    }
}
