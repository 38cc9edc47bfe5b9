use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

struct WindowState {
    window_start: Instant,
    count: u32,
}

/// Global send pacing for one pipeline instance: at most `max_per_second`
/// acquisitions leave within any 1-second window. The wait is computed under
/// the lock and slept outside it, so a slow sender never serializes the rest
/// of the pipeline behind the lock.
pub struct RateLimiter {
    max_per_second: u32,
    state: Mutex<WindowState>,
}

const WINDOW: Duration = Duration::from_secs(1);

impl RateLimiter {
    pub fn new(max_per_second: u32) -> Self {
        Self {
            max_per_second: max_per_second.max(1),
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                count: 0,
            }),
        }
    }

    /// Take one send token, waiting for the window to roll when exhausted.
    /// Dropping the future cancels the wait.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(state.window_start);
                if elapsed >= WINDOW {
                    state.window_start = now;
                    state.count = 0;
                }
                if state.count < self.max_per_second {
                    state.count += 1;
                    return;
                }
                WINDOW.saturating_sub(elapsed)
            };
            sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn burst_within_limit_does_not_wait() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn excess_waits_for_window_roll() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // third acquisition had to wait for the next window
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquires_respect_window() {
        let limiter = Arc::new(RateLimiter::new(3));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..7 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.acquire().await }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // 7 tokens at 3/s needs at least two extra windows
        assert!(start.elapsed() >= Duration::from_millis(1900));
    }
}
