//! In-process token bucket limiters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::backend::{EventLimiter, Limiter};
use super::reservation::Reservation;
use crate::error::Result;

/// Number of per-event buckets kept before idle ones are pruned.
pub const DEFAULT_PRUNE_THRESHOLD: usize = 10_000;

/// Shortest refill interval; shorter ones are rounded up to it.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A token bucket holding `quota` tokens, refilled uniformly over `interval`.
///
/// State lives in process memory and is driven by the monotonic clock, so
/// wall clock adjustments do not affect it. Refill and consume happen in one
/// critical section.
pub struct TokenBucket {
    /// Bucket capacity
    capacity: f64,
    /// Tokens added per second
    rate: f64,
    /// Refill interval, used as the delay when the quota is zero
    interval: Duration,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket. Intervals below one millisecond are rounded up.
    pub fn new(quota: u64, interval: Duration) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let capacity = quota as f64;
        Self {
            capacity,
            rate: capacity / interval.as_secs_f64(),
            interval,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Reserve a token as of `now`.
    pub fn reserve_at(&self, now: Instant) -> Reservation {
        let mut state = self.state.lock();
        self.refill(&mut state, now);

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Reservation::admit(state.tokens.floor() as i64)
        } else if self.rate > 0.0 {
            let missing = 1.0 - state.tokens;
            Reservation::reject(Duration::from_secs_f64(missing / self.rate))
        } else {
            Reservation::reject(self.interval)
        }
    }

    /// Tokens available as of `now`, without consuming any.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, now);
        state.tokens
    }

    /// Whether the bucket has refilled completely as of `now`.
    pub fn is_full_at(&self, now: Instant) -> bool {
        self.tokens_at(now) >= self.capacity
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        // Instants older than the last refill are treated as "no time passed"
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        state.last_refill = now;
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    async fn reserve(&self) -> Result<Reservation> {
        Ok(self.reserve_at(Instant::now()))
    }
}

/// A token bucket per event ID, all sharing one quota and interval.
///
/// Buckets are created on first use. Once the map grows past the prune
/// threshold, buckets that have refilled completely are dropped; a dropped
/// bucket is recreated full, so pruning is not observable. Reservations are
/// taken while holding the bucket's map entry, so a prune never races one.
///
/// A prune that leaves `n` buckets defers the next one until the map holds
/// more than `2n` (and at least the threshold).
pub struct LocalEventLimiter {
    quota: u64,
    interval: Duration,
    buckets: DashMap<String, TokenBucket>,
    prune_threshold: usize,
    /// Bucket count above which the next prune runs
    next_prune: AtomicUsize,
}

impl LocalEventLimiter {
    /// Create a keyed limiter. Intervals below one millisecond are rounded up.
    pub fn new(quota: u64, interval: Duration) -> Self {
        Self {
            quota,
            interval: interval.max(MIN_INTERVAL),
            buckets: DashMap::new(),
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            next_prune: AtomicUsize::new(DEFAULT_PRUNE_THRESHOLD),
        }
    }

    /// Set the number of buckets kept before idle ones are pruned.
    pub fn with_prune_threshold(mut self, threshold: usize) -> Self {
        self.prune_threshold = threshold;
        self.next_prune = AtomicUsize::new(threshold);
        self
    }

    /// Reserve a token for `event_id` as of `now`.
    pub fn reserve_event_at(&self, event_id: &str, now: Instant) -> Reservation {
        let existing = self.buckets.get(event_id).map(|bucket| bucket.reserve_at(now));
        let reservation = match existing {
            Some(reservation) => reservation,
            None => self
                .buckets
                .entry(event_id.to_string())
                .or_insert_with(|| TokenBucket::new(self.quota, self.interval))
                .reserve_at(now),
        };

        trace!(
            event_id = %event_id,
            ok = reservation.is_ok(),
            tokens = reservation.tokens(),
            "Local reservation"
        );

        if self.buckets.len() > self.next_prune.load(Ordering::Relaxed) {
            self.prune(now);
        }
        reservation
    }

    /// Drop buckets that have refilled completely as of `now`.
    pub fn prune(&self, now: Instant) {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_full_at(now));
        let after = self.buckets.len();
        let next = self.prune_threshold.max(after.saturating_mul(2));
        self.next_prune.store(next, Ordering::Relaxed);
        debug!(
            before = before,
            after = after,
            next_prune = next,
            "Pruned idle token buckets"
        );
    }

    /// Number of live buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl EventLimiter for LocalEventLimiter {
    async fn reserve_event(&self, event_id: &str) -> Result<Reservation> {
        Ok(self.reserve_event_at(event_id, Instant::now()))
    }
}
