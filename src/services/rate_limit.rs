//! Per-feed rate limiting for opt-in enrollment.
//!
//! Uses a fixed-window counter with in-memory storage, scoped to one
//! indexer instance. Counts are per feed_id and reset when the window
//! rolls over. Under multi-replica deployment each process keeps its own
//! window; the global enrollment rate can exceed the per-process cap by
//! the replica count, which is an accepted tradeoff (the cap exists to
//! stop tag spam from growing a feed without bound, not to meter exactly).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rate limiter configuration
pub struct RateLimitConfig {
    /// Maximum enrollments allowed per window
    pub max_per_window: u32,
    /// Window length
    pub window: Duration,
}

struct FeedWindow {
    window_start: Instant,
    count: u32,
}

/// Fixed-window counter keyed by feed id
pub struct EnrollmentRateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<i64, FeedWindow>>,
}

impl EnrollmentRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether one more enrollment is allowed for the given feed.
    /// Consumes a slot when allowed; returns false when the window is full.
    pub fn check(&self, feed_id: i64) -> bool {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();

        let entry = windows.entry(feed_id).or_insert_with(|| FeedWindow {
            window_start: now,
            count: 0,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.window_start = now;
            entry.count = 0;
        }

        if entry.count < self.config.max_per_window {
            entry.count += 1;
            true
        } else {
            false
        }
    }

    /// Drop windows that rolled over long ago so the map does not grow with
    /// feeds that stopped receiving enrollments.
    pub fn cleanup(&self) {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let stale = self.config.window * 2;
        windows.retain(|_, w| now.duration_since(w.window_start) < stale);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32) -> EnrollmentRateLimiter {
        EnrollmentRateLimiter::new(RateLimitConfig {
            max_per_window: max,
            window: Duration::from_secs(3600),
        })
    }

    #[test]
    fn test_allows_up_to_cap_then_blocks() {
        let rl = limiter(3);
        assert!(rl.check(1));
        assert!(rl.check(1));
        assert!(rl.check(1));
        assert!(!rl.check(1));
    }

    #[test]
    fn test_feeds_have_independent_windows() {
        let rl = limiter(1);
        assert!(rl.check(1));
        assert!(!rl.check(1));
        assert!(rl.check(2));
    }
}
