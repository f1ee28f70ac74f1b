//! In-process window store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{window_position, WindowCount, WindowStore};
use crate::error::Result;

/// Expired windows are swept once every this many increments.
const SWEEP_EVERY: u64 = 1024;

/// A [`WindowStore`] held in process memory.
///
/// Counters are only shared by limiters in this process. Atomicity comes
/// from the map's entry lock: the increment and the expiry are applied while
/// holding it.
#[derive(Default)]
pub struct MemoryStore {
    windows: DashMap<String, Window>,
    ops: AtomicU64,
}

struct Window {
    count: u64,
    expires_at: Instant,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment `key` as of wall clock time `now_ms` (milliseconds since the
    /// Unix epoch) and monotonic time `now`.
    pub fn increment_at(&self, key: &str, window: Duration, now_ms: u64, now: Instant) -> WindowCount {
        let (epoch, remaining) = window_position(now_ms, window);
        let store_key = format!("{}:{}", key, epoch);

        let (count, ttl) = {
            let mut entry = self.windows.entry(store_key).or_insert_with(|| Window {
                count: 0,
                expires_at: now + remaining,
            });
            if entry.expires_at <= now {
                entry.count = 0;
                entry.expires_at = now + remaining;
            }
            entry.count += 1;
            (entry.count, entry.expires_at.saturating_duration_since(now))
        };

        trace!(key = %key, epoch = epoch, count = count, "Incremented window counter");

        if self.ops.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }

        WindowCount { count, ttl, epoch }
    }

    /// Remove windows that have expired as of `now`.
    pub fn sweep(&self, now: Instant) {
        self.windows.retain(|_, window| window.expires_at > now);
    }

    /// Number of live window counters.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Ok(self.increment_at(key, window, now_ms, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_increment_counts_within_window() {
        let store = MemoryStore::new();
        let now = Instant::now();

        let first = store.increment_at("k", MINUTE, 120_000, now);
        assert_eq!(first.count, 1);
        assert_eq!(first.epoch, 2);
        assert_eq!(first.ttl, MINUTE);

        let second = store.increment_at("k", MINUTE, 150_000, now + Duration::from_secs(30));
        assert_eq!(second.count, 2);
        assert_eq!(second.epoch, 2);
        assert_eq!(second.ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_next_epoch_starts_fresh() {
        let store = MemoryStore::new();
        let now = Instant::now();

        store.increment_at("k", MINUTE, 0, now);
        store.increment_at("k", MINUTE, 1_000, now);
        let next = store.increment_at("k", MINUTE, 60_000, now + MINUTE);
        assert_eq!(next.count, 1);
        assert_eq!(next.epoch, 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let store = MemoryStore::new();
        let now = Instant::now();

        store.increment_at("a", MINUTE, 0, now);
        store.increment_at("a", MINUTE, 0, now);
        assert_eq!(store.increment_at("b", MINUTE, 0, now).count, 1);
    }

    #[test]
    fn test_sweep_removes_expired_windows() {
        let store = MemoryStore::new();
        let now = Instant::now();

        store.increment_at("a", MINUTE, 0, now);
        store.increment_at("b", MINUTE, 30_000, now);
        assert_eq!(store.len(), 2);

        // "b" landed half way through the window and expires first
        store.sweep(now + Duration::from_secs(30));
        assert_eq!(store.len(), 1);

        store.sweep(now + MINUTE);
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_serialized() {
        let store = Arc::new(MemoryStore::new());
        let now = Instant::now();

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_at("hot", MINUTE, 0, now).count })
            })
            .collect();

        let mut counts: Vec<u64> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        counts.sort_unstable();

        assert_eq!(counts, (1..=64).collect::<Vec<u64>>());
    }
}
