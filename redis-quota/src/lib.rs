//! The shared-KV side of tenant accounting: a Redis pool, the atomic
//! token-bucket balance script, and the tiny KV surface the gateway needs.
//!
//! The gateway only ever talks to [`QuotaStore`]. Tests swap in an in-memory
//! implementation, production uses [`RedisQuotaStore`].

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, Script};
use deadpool_redis::{Config as PoolConfig, Pool, Runtime};
use tracing::trace;

pub use deadpool_redis::redis::RedisError;
pub use deadpool_redis::PoolError as RedisPoolError;

/// Hash fields of the per-bucket `app#<token>:<bucket>` key.
pub const FIELD_BALANCE: &str = "balance";
pub const FIELD_LAST_TIME: &str = "last";
pub const FIELD_CAPACITY: &str = "capacity";
pub const FIELD_RATE: &str = "rate";

// Runs entirely on the Redis server so that concurrent debits from many
// gateway processes stay atomic. `rate` is units recovered per millisecond.
const BALANCE_SCRIPT: &str = r#"
local capacity = math.floor(tonumber(ARGV[1]))
local rate = tonumber(ARGV[2])
if (capacity <= 0) then
    return 0
end
if (rate <= 0) then
    return 0
end
redis.call('hsetnx', KEYS[1], 'balance', capacity)
local time = redis.call('time')
local now = (time[1] * 1000) + math.floor(time[2] / 1000)
local last = tonumber(redis.call('hget', KEYS[1], 'last') or now)
if (last > now) then last = now end
local recovery = math.floor((now - last) * rate)
local residual = math.floor(redis.call('hincrby', KEYS[1], 'balance', -1))
local current = math.min(capacity - 1, residual + recovery)
redis.call('hset', KEYS[1], 'balance', current)
return current
"#;

/// What the tenant engine needs from the shared KV.
///
/// `balance` must be atomic across processes. The rest is plain KV traffic
/// and only has to be eventually consistent.
#[async_trait]
pub trait QuotaStore: Send + Sync + 'static {
    /// Debit one unit from the bucket at `key`, applying elapsed-time
    /// recovery, and return the resulting balance. `rate` is units per
    /// millisecond.
    async fn balance(&self, key: &str, capacity: i64, rate: f64) -> anyhow::Result<i64>;

    async fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn set_blob(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()>;

    /// Debounced usage write-back: HSET the last access time and HINCRBY the
    /// balance by the compensating `offset`.
    async fn flush_usage(
        &self,
        key: &str,
        last_time: Option<i64>,
        offset: i64,
    ) -> anyhow::Result<()>;
}

pub struct RedisQuotaStore {
    pool: Pool,
    balance_script: Script,
}

impl RedisQuotaStore {
    pub fn new(redis_url: &str) -> anyhow::Result<Self> {
        let pool = PoolConfig::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .context("creating redis pool")?;

        Ok(Self {
            pool,
            balance_script: Script::new(BALANCE_SCRIPT),
        })
    }
}

#[async_trait]
impl QuotaStore for RedisQuotaStore {
    async fn balance(&self, key: &str, capacity: i64, rate: f64) -> anyhow::Result<i64> {
        let mut conn = self.pool.get().await?;

        let current: i64 = self
            .balance_script
            .key(key)
            .arg(capacity)
            .arg(rate)
            .invoke_async(&mut conn)
            .await?;

        trace!(%key, current, "balance");

        Ok(current)
    }

    async fn get_blob(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let mut conn = self.pool.get().await?;

        let value: Option<Vec<u8>> = conn.get(key).await?;

        Ok(value)
    }

    async fn set_blob(&self, key: &str, value: Vec<u8>, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;

        let _: () = conn.set_ex(key, value, ttl.as_secs() as usize).await?;

        Ok(())
    }

    async fn flush_usage(
        &self,
        key: &str,
        last_time: Option<i64>,
        offset: i64,
    ) -> anyhow::Result<()> {
        let mut conn = self.pool.get().await?;

        let mut pipe = redis::pipe();
        if let Some(last_time) = last_time {
            pipe.hset(key, FIELD_LAST_TIME, last_time).ignore();
        }
        if offset > 0 {
            pipe.hincr(key, FIELD_BALANCE, offset).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(())
    }
}
