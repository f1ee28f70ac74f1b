//! Redis-backed window store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{info, trace};

use super::{WindowCount, WindowStore};
use crate::error::{RatemuxError, Result};

/// Increment-with-expiry as one server-side operation.
///
/// The epoch is derived from the server clock so every process agrees on
/// window boundaries regardless of local clock skew. The expiry is only set
/// when the counter has none, which happens exactly once per epoch.
const INCREMENT_SCRIPT: &str = r#"
local time_array = redis.call("TIME")
local now_ms = tonumber(time_array[1]) * 1000 + math.floor(tonumber(time_array[2]) / 1000)

local window_ms = tonumber(ARGV[1])
local epoch = math.floor(now_ms / window_ms)
local key = KEYS[1] .. ":" .. string.format("%d", epoch)

local count = redis.call("INCR", key)
local ttl = redis.call("PTTL", key)
if ttl < 0 then
    ttl = (epoch + 1) * window_ms - now_ms
    redis.call("PEXPIRE", key, ttl)
end

return {count, ttl, epoch}
"#;

/// A [`WindowStore`] shared by every process connected to the same Redis.
///
/// The script derives the counter key from `KEYS[1]`, so it targets a
/// standalone or sentinel-managed Redis rather than a sharded cluster.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
        }
    }

    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!("Connected to Redis window store");
        Ok(Self::new(connection))
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let window_ms = (window.as_millis() as u64).max(1);
        let mut connection = self.connection.clone();

        let (count, ttl_ms, epoch): (u64, i64, u64) = self
            .script
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut connection)
            .await?;

        trace!(key = %key, epoch = epoch, count = count, ttl_ms = ttl_ms, "Incremented window counter");

        if ttl_ms < 0 {
            return Err(RatemuxError::Store(format!(
                "window counter for {} has no expiry",
                key
            )));
        }

        Ok(WindowCount {
            count,
            ttl: Duration::from_millis(ttl_ms as u64),
            epoch,
        })
    }
}
