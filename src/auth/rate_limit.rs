use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Request counter used to blunt magic-link abuse. Implementations may be
/// process-local; under-counting across instances is accepted.
#[async_trait]
pub trait RateLimitCounter: Send + Sync {
    /// Records an attempt for `key` and returns whether it is allowed.
    async fn check(&self, key: &str) -> bool;
}

#[derive(Debug)]
struct Window {
    count: u32,
    reset_at: Instant,
}

/// In-memory counter with a rolling window. Resets on process restart, which
/// is acceptable for this limiter.
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_requests: u32,
    window: Duration,
}

impl InMemoryRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_requests,
            window,
        }
    }

    /// 3 requests per email per rolling hour.
    pub fn magic_link_default() -> Self {
        Self::new(3, Duration::from_secs(3600))
    }
}

#[async_trait]
impl RateLimitCounter for InMemoryRateLimiter {
    async fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        match windows.get_mut(key) {
            Some(window) if now < window.reset_at => {
                if window.count >= self.max_requests {
                    return false;
                }
                window.count += 1;
                true
            }
            _ => {
                windows.insert(
                    key.to_string(),
                    Window {
                        count: 1,
                        reset_at: now + self.window,
                    },
                );
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn allows_up_to_limit_then_rejects() {
        let limiter = InMemoryRateLimiter::magic_link_default();
        for _ in 0..3 {
            assert!(limiter.check("a@x.com").await);
        }
        assert!(!limiter.check("a@x.com").await);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let limiter = InMemoryRateLimiter::magic_link_default();
        for _ in 0..3 {
            assert!(limiter.check("a@x.com").await);
        }
        assert!(!limiter.check("a@x.com").await);
        assert!(limiter.check("b@x.com").await);
    }

    #[tokio::test]
    async fn window_resets_after_expiry() {
        let limiter = InMemoryRateLimiter::new(1, Duration::from_millis(50));
        assert!(limiter.check("a@x.com").await);
        assert!(!limiter.check("a@x.com").await);
        sleep(Duration::from_millis(80)).await;
        assert!(limiter.check("a@x.com").await);
    }
}
