//! Shared window store backed by Redis sorted sets.
//!
//! Each bucket is one sorted set under `rate_limit:{classification}:{client}`
//! whose scores are admission timestamps in milliseconds. The whole
//! evict/count/append sequence runs server-side in a single Lua script, so
//! every gateway instance sees the same counts.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{RateGateError, Result};
use crate::ratelimit::{BucketKey, StoreError, WindowOutcome, WindowStore};

/// KEYS[1] = bucket key
/// ARGV = now_ms, window_ms, limit, member
/// Returns {admitted (0/1), count before this request, oldest score or -1}.
///
/// An admitted entry is scored at the later of `now` and the newest score,
/// the same timestamp the in-process log records when the clock steps back.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  local ts = ARGV[1]
  local newest = redis.call('ZRANGE', key, -1, -1, 'WITHSCORES')
  if newest[2] and tonumber(newest[2]) > now then
    ts = newest[2]
  end
  redis.call('ZADD', key, ts, ARGV[4])
  admitted = 1
end
redis.call('PEXPIRE', key, window)

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_ms = -1
if oldest[2] then
  oldest_ms = tonumber(oldest[2])
end
return {admitted, count, oldest_ms}
"#;

/// Redis-backed [`WindowStore`].
pub struct RedisStore {
    client: Client,
    /// Established lazily; `None` until the first successful connect
    connection: RwLock<Option<ConnectionManager>>,
    connect_timeout: Duration,
    script: Script,
    /// Connection URL with the password masked
    display_url: String,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.display_url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl RedisStore {
    /// Create a store from configuration. Does not connect.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let url = config.url()?;
        let client = Client::open(url.as_str())
            .map_err(|e| RateGateError::Config(format!("invalid store URL: {}", e)))?;

        Ok(Self {
            client,
            connection: RwLock::new(None),
            connect_timeout: Duration::from_millis(config.timeout_ms),
            script: Script::new(SLIDING_WINDOW_SCRIPT),
            display_url: config.redacted_url(),
        })
    }

    /// The connection URL with credentials masked.
    pub fn display_url(&self) -> &str {
        &self.display_url
    }

    /// Whether a connection has been established.
    pub fn is_connected(&self) -> bool {
        self.connection.read().is_some()
    }

    async fn connection(&self) -> std::result::Result<ConnectionManager, StoreError> {
        let cached = self.connection.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        debug!(url = %self.display_url, "Connecting to shared rate limit store");
        let conn = tokio::time::timeout(self.connect_timeout, self.client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout(self.connect_timeout))?
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        info!(url = %self.display_url, "Connected to shared rate limit store");
        *self.connection.write() = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn try_admit(
        &self,
        key: &BucketKey,
        now_ms: i64,
        window_ms: i64,
        limit: u64,
    ) -> std::result::Result<WindowOutcome, StoreError> {
        let mut conn = self.connection().await?;
        let member = format!("{}-{}", now_ms, Uuid::new_v4().simple());

        let reply: Vec<i64> = self
            .script
            .key(key.store_key())
            .arg(now_ms)
            .arg(window_ms)
            .arg(limit)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        parse_reply(&reply)
    }

    async fn ping(&self) -> std::result::Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

fn parse_reply(reply: &[i64]) -> std::result::Result<WindowOutcome, StoreError> {
    match *reply {
        [admitted, count, oldest] => Ok(WindowOutcome {
            admitted: admitted == 1,
            count: u64::try_from(count)
                .map_err(|_| StoreError::Protocol(format!("negative count {}", count)))?,
            oldest_ms: (oldest >= 0).then_some(oldest),
        }),
        _ => Err(StoreError::Protocol(format!(
            "expected 3 values from sliding window script, got {}",
            reply.len()
        ))),
    }
}
