use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tracing::debug;

use crate::error::StoreError;
use crate::services::store::StateBackend;

pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Builds the pool without connecting; the store pings it before use.
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let pool = Config::from_url(redis_url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Pool(format!("Failed to create Redis pool: {}", e)))?;

        debug!("Redis pool created");
        Ok(Self { pool })
    }

    async fn get_connection(&self) -> Result<Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(format!("Failed to get Redis connection: {}", e)))
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait]
impl StateBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn increment_with_ttl(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        let mut conn = self.get_connection().await?;
        let (count, remaining): (u64, i64) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await?;

        // first increment of the window, or a counter that lost its expiry
        if remaining < 0 {
            let _: () = redis::cmd("EXPIRE")
                .arg(key)
                .arg(ttl_secs(ttl))
                .query_async(&mut conn)
                .await?;
        }

        Ok(count)
    }

    async fn append_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.get_connection().await?;
        let items: Vec<String> = conn.lrange(key, 0, -1).await?;
        Ok(items)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.get_connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }
}
