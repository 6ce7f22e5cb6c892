//! A narrow trait seam over the handful of Redis commands this system
//! uses, plus a pooled `redis`-backed implementation and an in-memory fake
//! for tests. Every other crate depends on `RedisLike`, never on
//! `redis::Client`/`deadpool_redis::Pool` directly, so the queue, cache and
//! HA logic can be exercised without a live Redis.

pub mod fake;
mod pooled;

use std::time::Duration;

use async_trait::async_trait;

pub use pooled::PooledRedis;

#[derive(Debug, thiserror::Error)]
pub enum RedisError {
    #[error("redis error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("redis pool error: {0}")]
    Pool(#[from] deadpool_redis::PoolError),
}

/// A single popped element: the list key it came from, and its raw bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Popped {
    pub key: String,
    pub value: Vec<u8>,
}

/// The Redis operations the Producer, Consumer, cache and HA coordinator
/// need. Blocking commands (`BRPOP`, `BLMOVE`) return `Ok(None)` on timeout
/// rather than blocking forever, matching spec §5's requirement that every
/// suspension point be boundedly cancellable.
#[async_trait]
pub trait RedisLike: Send + Sync {
    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), RedisError>;

    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), RedisError>;

    /// `BRPOP key1 key2 .. timeout`, honoring list order for priority.
    async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<Popped>, RedisError>;

    /// `BLMOVE src dst LEFT RIGHT timeout`.
    async fn blmove(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, RedisError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RedisError>;

    async fn set(&self, key: &str, value: Vec<u8>, ex_secs: Option<i64>) -> Result<(), RedisError>;

    /// `SET key value NX PX ttl_ms`. Returns whether the lock was acquired.
    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool, RedisError>;

    async fn expire(&self, key: &str, secs: i64) -> Result<bool, RedisError>;

    async fn pexpire(&self, key: &str, ms: i64) -> Result<bool, RedisError>;

    async fn del(&self, key: &str) -> Result<(), RedisError>;

    async fn exists(&self, key: &str) -> Result<bool, RedisError>;

    async fn llen(&self, key: &str) -> Result<i64, RedisError>;

    /// Enumerate all keys matching a glob pattern. Acceptable coarseness
    /// for the HA node-count estimate (spec §4.F step 2); never used on a
    /// data-plane hot path.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>, RedisError>;

    /// Delete `key` iff its current value equals `expected`. Implemented
    /// as a Lua CAS so check-and-delete is atomic (spec §4.F step 7).
    async fn cas_del(&self, key: &str, expected: &str) -> Result<bool, RedisError>;
}
