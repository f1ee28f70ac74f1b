//! Outcome of a single admission check.

use std::time::Duration;

/// Smallest delay a rejection can carry.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// A point-in-time reservation of a rate limit token.
///
/// A reservation is admitted when its delay is zero. Otherwise the delay is
/// the time until the next token becomes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    delay: Duration,
    tokens: i64,
}

impl Reservation {
    /// An admitted reservation with `tokens` left after it.
    pub fn admit(tokens: i64) -> Self {
        Self {
            delay: Duration::ZERO,
            tokens: tokens.max(0),
        }
    }

    /// A rejected reservation. The delay is clamped to at least 1ms so a
    /// rejection can never read as admitted.
    pub fn reject(delay: Duration) -> Self {
        Self {
            delay: delay.max(MIN_DELAY),
            tokens: 0,
        }
    }

    /// Whether the request may proceed.
    pub fn is_ok(&self) -> bool {
        self.delay.is_zero()
    }

    /// Time until the next token becomes available.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Tokens remaining after this reservation.
    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    /// The delay rounded up to whole seconds, for a `Retry-After` header.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.delay.as_secs();
        if self.delay.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}
