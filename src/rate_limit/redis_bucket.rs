//! Redis-backed token bucket with atomic decrement and TTL refill.

use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::Script;
use serde::{Deserialize, Serialize};

use crate::state::{StateResult, StateStore};

/// Key prefix for rate limit buckets.
const KEY_PREFIX: &str = "ratelimit:bucket:";

/// Token budget per provider per window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub capacity: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 30,
            window_secs: 60,
        }
    }
}

/// One shared token bucket per provider name.
#[derive(Clone)]
pub struct RedisTokenBucket {
    conn: ConnectionManager,
    config: RateLimitConfig,
}

impl RedisTokenBucket {
    pub fn new(store: &StateStore, config: RateLimitConfig) -> Self {
        Self {
            conn: store.connection(),
            config,
        }
    }

    fn bucket_key(provider: &str) -> String {
        format!("{}{}", KEY_PREFIX, provider)
    }

    /// Try to take one token.
    ///
    /// Returns `Duration::ZERO` when a token was taken, otherwise the time
    /// until the bucket refills.
    pub async fn acquire(&self, provider: &str) -> StateResult<Duration> {
        let mut conn = self.conn.clone();
        let key = Self::bucket_key(provider);

        // Atomic take-or-report-wait.
        let script = Script::new(
            r#"
            local key = KEYS[1]
            local capacity = tonumber(ARGV[1])
            local window_ms = tonumber(ARGV[2])

            local tokens = redis.call('GET', key)
            if tokens == false then
                redis.call('SET', key, capacity - 1, 'PX', window_ms)
                return 0
            end
            if tonumber(tokens) > 0 then
                redis.call('DECR', key)
                return 0
            end
            local ttl = redis.call('PTTL', key)
            if ttl < 0 then
                redis.call('SET', key, capacity - 1, 'PX', window_ms)
                return 0
            end
            return ttl
        "#,
        );

        let wait_ms: i64 = script
            .key(&key)
            .arg(self.config.capacity)
            .arg(self.config.window_secs * 1000)
            .invoke_async(&mut conn)
            .await?;

        Ok(Duration::from_millis(wait_ms.max(0) as u64))
    }

    /// Block until a token is available.
    pub async fn wait_ready(&self, provider: &str) -> StateResult<()> {
        loop {
            let wait = self.acquire(provider).await?;
            if wait.is_zero() {
                return Ok(());
            }
            tracing::debug!(provider, wait_ms = wait.as_millis() as u64, "rate limit wait");
            tokio::time::sleep(wait).await;
        }
    }
}
