use async_trait::async_trait;
use std::time::Duration;

use super::error::CacheResult;

/// Key/value store shared by every instance of the service.
///
/// `claim` and `compare_and_swap` must be atomic with respect to concurrent callers
/// on any instance; they are the only primitives the idempotency guard and webhook
/// dedupe rely on for ordering.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Returns true if a key was removed
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Set `key` only if absent. Returns true if this caller created it.
    async fn claim(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool>;

    /// Replace the value only if it currently equals `expected`.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new_value: &str,
        ttl: Duration,
    ) -> CacheResult<bool>;

    /// Add `member` to the sorted set at `key`, or move it to `score`
    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> CacheResult<()>;

    async fn sorted_remove(&self, key: &str, member: &str) -> CacheResult<()>;

    /// Every member of the sorted set, lowest score first
    async fn sorted_members(&self, key: &str) -> CacheResult<Vec<String>>;

    async fn ping(&self) -> CacheResult<()>;

    fn backend_name(&self) -> &'static str;
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[cfg(feature = "cache")]
pub use redis_backend::RedisCache;

#[cfg(feature = "cache")]
mod redis_backend {
    use super::*;
    use crate::cache::error::CacheError;
    use crate::cache::RedisPool;
    use bb8::PooledConnection;
    use bb8_redis::RedisConnectionManager;
    use redis::AsyncCommands;

    const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  return 1
end
return 0
"#;

    /// Redis-backed shared cache
    #[derive(Clone)]
    pub struct RedisCache {
        pool: RedisPool,
    }

    impl RedisCache {
        pub fn new(pool: RedisPool) -> Self {
            Self { pool }
        }

        pub async fn get_connection(
            &self,
        ) -> CacheResult<PooledConnection<'_, RedisConnectionManager>> {
            self.pool
                .get()
                .await
                .map_err(|e| CacheError::ConnectionError(e.to_string()))
        }

        pub fn pool(&self) -> &RedisPool {
            &self.pool
        }
    }

    #[async_trait]
    impl SharedCache for RedisCache {
        async fn get(&self, key: &str) -> CacheResult<Option<String>> {
            let mut conn = self.get_connection().await?;
            let value: Option<String> = conn.get(key).await?;
            Ok(value)
        }

        async fn set(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()> {
            let mut conn = self.get_connection().await?;
            let _: () = conn.set_ex(key, value, ttl_secs(ttl)).await?;
            Ok(())
        }

        async fn delete(&self, key: &str) -> CacheResult<bool> {
            let mut conn = self.get_connection().await?;
            let removed: i64 = conn.del(key).await?;
            Ok(removed > 0)
        }

        async fn claim(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<bool> {
            let mut conn = self.get_connection().await?;
            let reply: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(value)
                .arg("NX")
                .arg("EX")
                .arg(ttl_secs(ttl))
                .query_async(&mut *conn)
                .await?;
            Ok(reply.is_some())
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: &str,
            new_value: &str,
            ttl: Duration,
        ) -> CacheResult<bool> {
            let mut conn = self.get_connection().await?;
            let swapped: i64 = redis::Script::new(CAS_SCRIPT)
                .key(key)
                .arg(expected)
                .arg(new_value)
                .arg(ttl_secs(ttl))
                .invoke_async(&mut *conn)
                .await?;
            Ok(swapped == 1)
        }

        async fn sorted_add(&self, key: &str, member: &str, score: i64) -> CacheResult<()> {
            let mut conn = self.get_connection().await?;
            let _: i64 = redis::cmd("ZADD")
                .arg(key)
                .arg(score)
                .arg(member)
                .query_async(&mut *conn)
                .await?;
            Ok(())
        }

        async fn sorted_remove(&self, key: &str, member: &str) -> CacheResult<()> {
            let mut conn = self.get_connection().await?;
            let _: i64 = redis::cmd("ZREM")
                .arg(key)
                .arg(member)
                .query_async(&mut *conn)
                .await?;
            Ok(())
        }

        async fn sorted_members(&self, key: &str) -> CacheResult<Vec<String>> {
            let mut conn = self.get_connection().await?;
            let members: Vec<String> = redis::cmd("ZRANGE")
                .arg(key)
                .arg(0)
                .arg(-1)
                .query_async(&mut *conn)
                .await?;
            Ok(members)
        }

        async fn ping(&self) -> CacheResult<()> {
            let mut conn = self.get_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "redis"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_is_at_least_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(86400)), 86400);
    }
}
