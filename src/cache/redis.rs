//! Redis cache tier
//!
//! Entries are JSON strings under namespaced, epoch-prefixed keys with a
//! per-key TTL. Prefix deletion uses a cursor-based `SCAN` (non-blocking)
//! batched by 100, deleting up to 50 keys per batch with `UNLINK` and a
//! blocking `DEL` fallback.

use async_trait::async_trait;
use deadpool_redis::{Config as DeadpoolConfig, Pool, Runtime};
use std::time::Duration;

use crate::cache::CacheBackend;
use crate::config::RedisConfig;
use crate::error::{Error, Result};

const SCAN_COUNT: usize = 100;
const DELETE_BATCH: usize = 50;

/// Connection-pooled Redis backend
pub struct RedisBackend {
    pool: Pool,
}

impl RedisBackend {
    /// Create the pool and verify connectivity
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let cfg = DeadpoolConfig::from_url(&config.url);
        let pool = cfg
            .builder()
            .map_err(|e| Error::RedisPool(format!("failed to build Redis pool: {e}")))?
            .max_size(config.max_connections)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| Error::RedisPool(format!("failed to create Redis pool: {e}")))?;

        // Test the connection
        let mut conn = pool
            .get()
            .await
            .map_err(|e| Error::RedisPool(format!("failed to get Redis connection: {e}")))?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            "Redis cache backend connected"
        );
        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| Error::RedisPool(e.to_string()))
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut *conn)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<()>(&mut *conn)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut deleted: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut *conn)
                .await?;

            for batch in keys.chunks(DELETE_BATCH) {
                let unlinked: std::result::Result<u64, redis::RedisError> =
                    redis::cmd("UNLINK")
                        .arg(batch)
                        .query_async(&mut *conn)
                        .await;
                deleted += match unlinked {
                    Ok(n) => n,
                    Err(e) => {
                        // Older servers without UNLINK fall back to DEL.
                        tracing::debug!("UNLINK unavailable ({e}), falling back to DEL");
                        redis::cmd("DEL")
                            .arg(batch)
                            .query_async::<u64>(&mut *conn)
                            .await?
                    }
                };
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(deleted)
    }

    async fn entries(&self) -> Result<u64> {
        let mut conn = self.conn().await?;
        let size: u64 = redis::cmd("DBSIZE").query_async(&mut *conn).await?;
        Ok(size)
    }
}
