use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Runtime};
use redis::AsyncCommands;

use crate::{Popped, RedisError, RedisLike};

/// A pooled, async Redis client. One `PooledRedis` is created at startup
/// and shared (via `Arc`) by every task in the process — the teacher's
/// design note calls this out explicitly ("global Redis client ... passed
/// to all components via parameters, not implicit module state").
#[derive(Clone)]
pub struct PooledRedis {
    pool: deadpool_redis::Pool,
}

impl PooledRedis {
    pub fn connect(redis_url: &str) -> Result<Self, RedisError> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|err| RedisError::Backend(redis::RedisError::from(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))))?;
        Ok(PooledRedis { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, RedisError> {
        Ok(self.pool.get().await?)
    }
}

#[async_trait]
impl RedisLike for PooledRedis {
    async fn lpush(&self, key: &str, value: Vec<u8>) -> Result<(), RedisError> {
        let mut conn = self.conn().await?;
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: Vec<u8>) -> Result<(), RedisError> {
        let mut conn = self.conn().await?;
        let _: () = conn.rpush(key, value).await?;
        Ok(())
    }

    async fn brpop(&self, keys: &[&str], timeout: Duration) -> Result<Option<Popped>, RedisError> {
        let mut conn = self.conn().await?;
        let secs = timeout.as_secs_f64().max(0.0);
        let reply: Option<(String, Vec<u8>)> = conn.brpop(keys, secs).await?;
        Ok(reply.map(|(key, value)| Popped { key, value }))
    }

    async fn blmove(
        &self,
        src: &str,
        dst: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, RedisError> {
        let mut conn = self.conn().await?;
        let secs = timeout.as_secs_f64().max(0.0);
        let reply: Option<Vec<u8>> = redis::cmd("BLMOVE")
            .arg(src)
            .arg(dst)
            .arg("LEFT")
            .arg("RIGHT")
            .arg(secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RedisError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ex_secs: Option<i64>) -> Result<(), RedisError> {
        let mut conn = self.conn().await?;
        match ex_secs {
            Some(ex) => {
                let _: () = conn.set_ex(key, value, ex as u64).await?;
            }
            None => {
                let _: () = conn.set(key, value).await?;
            }
        }
        Ok(())
    }

    async fn set_nx_px(&self, key: &str, value: &str, ttl_ms: i64) -> Result<bool, RedisError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn expire(&self, key: &str, secs: i64) -> Result<bool, RedisError> {
        let mut conn = self.conn().await?;
        Ok(conn.expire(key, secs).await?)
    }

    async fn pexpire(&self, key: &str, ms: i64) -> Result<bool, RedisError> {
        let mut conn = self.conn().await?;
        Ok(conn.pexpire(key, ms).await?)
    }

    async fn del(&self, key: &str) -> Result<(), RedisError> {
        let mut conn = self.conn().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, RedisError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn llen(&self, key: &str) -> Result<i64, RedisError> {
        let mut conn = self.conn().await?;
        Ok(conn.llen(key).await?)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>, RedisError> {
        let mut conn = self.conn().await?;
        Ok(conn.keys(pattern).await?)
    }

    async fn cas_del(&self, key: &str, expected: &str) -> Result<bool, RedisError> {
        let mut conn = self.conn().await?;
        const SCRIPT: &str = r#"
            if redis.call("GET", KEYS[1]) == ARGV[1] then
                return redis.call("DEL", KEYS[1])
            else
                return 0
            end
        "#;
        let deleted: i64 = redis::Script::new(SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }
}
