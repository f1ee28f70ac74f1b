//! Shared counter stores for fixed-window rate limiting.
//!
//! A store owns the window arithmetic: it reads its own clock, derives the
//! window epoch and increments the epoch's counter, setting its expiry in
//! the same atomic step. Limiters on different processes pointed at the same
//! store therefore share one counter per key and window.

mod memory;
mod redis;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Counter state returned by a single increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Counter value after the increment
    pub count: u64,
    /// Time until the counter expires
    pub ttl: Duration,
    /// Index of the window the increment landed in
    pub epoch: u64,
}

/// A store supporting an atomic increment-with-expiry primitive.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Increment the counter of `key` for the current `window`-sized epoch.
    ///
    /// The first increment in an epoch creates the counter and sets it to
    /// expire at the end of the epoch, in the same atomic operation.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount>;
}

/// Split a wall clock timestamp into its window epoch and the time left in
/// that epoch.
pub(crate) fn window_position(now_ms: u64, window: Duration) -> (u64, Duration) {
    let window_ms = (window.as_millis() as u64).max(1);
    let epoch = now_ms / window_ms;
    let remaining = (epoch + 1) * window_ms - now_ms;
    (epoch, Duration::from_millis(remaining))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_position() {
        let minute = Duration::from_secs(60);
        assert_eq!(window_position(0, minute), (0, minute));
        assert_eq!(
            window_position(59_999, minute),
            (0, Duration::from_millis(1))
        );
        assert_eq!(window_position(60_000, minute), (1, minute));
        assert_eq!(
            window_position(90_000, minute),
            (1, Duration::from_secs(30))
        );
    }

    #[test]
    fn test_window_position_sub_millisecond_window() {
        let (epoch, remaining) = window_position(42, Duration::from_micros(10));
        assert_eq!(epoch, 42);
        assert_eq!(remaining, Duration::from_millis(1));
    }
}
