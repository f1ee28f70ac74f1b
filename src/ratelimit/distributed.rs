//! Distributed fixed-window rate limiter.
//!
//! Every limiter instance pointed at the same [`WindowStore`] and prefix
//! shares one counter per event ID and window, so the quota holds across
//! processes. All requests inside one `interval`-sized epoch share the
//! counter and it resets at the epoch boundary. A burst straddling a
//! boundary can therefore admit up to twice the quota.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::{EventLimiter, Limiter};
use super::key::EventKey;
use super::reservation::Reservation;
use crate::error::{RatemuxError, Result};
use crate::store::WindowStore;

/// A fixed-window limiter backed by a shared store.
pub struct FixedWindowLimiter {
    /// The store holding the window counters.
    store: Arc<dyn WindowStore>,
    /// Key namespace of this limiter.
    prefix: String,
    /// Window length.
    interval: Duration,
    /// Requests allowed per window.
    quota: u64,
    /// Deadline for a store round trip.
    timeout: Option<Duration>,
}

impl FixedWindowLimiter {
    /// Create a new fixed-window limiter.
    pub fn new(store: Arc<dyn WindowStore>, prefix: &str, interval: Duration, quota: u64) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            interval,
            quota,
            timeout: None,
        }
    }

    /// Bound every store round trip by `timeout`.
    ///
    /// When the deadline passes the attempt is abandoned and
    /// [`RatemuxError::DeadlineExceeded`] is returned. An increment that
    /// already reached the store stays counted.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    async fn reserve_key(&self, key: &EventKey) -> Result<Reservation> {
        let store_key = key.to_string_key();
        let increment = self.store.increment(&store_key, self.interval);

        let window = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, increment)
                .await
                .map_err(|_| RatemuxError::DeadlineExceeded(timeout))??,
            None => increment.await?,
        };

        trace!(
            key = %key,
            epoch = window.epoch,
            count = window.count,
            quota = self.quota,
            "Checked fixed window"
        );

        if window.count <= self.quota {
            Ok(Reservation::admit((self.quota - window.count) as i64))
        } else {
            debug!(
                key = %key,
                count = window.count,
                quota = self.quota,
                retry_in = ?window.ttl,
                "Fixed window exhausted"
            );
            Ok(Reservation::reject(window.ttl))
        }
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    async fn reserve(&self) -> Result<Reservation> {
        self.reserve_key(&EventKey::new(&self.prefix, "")).await
    }
}

#[async_trait]
impl EventLimiter for FixedWindowLimiter {
    async fn reserve_event(&self, event_id: &str) -> Result<Reservation> {
        self.reserve_key(&EventKey::new(&self.prefix, event_id)).await
    }
}
