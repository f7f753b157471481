use {
    async_trait::async_trait,
    redis::aio::MultiplexedConnection,
    tokio::sync::Mutex,
    tracing::debug,
};

use crate::store::{RateLimitStore, RateLimitStoreError};

const STORE: &str = "redis";

/// Shared counter store: one sorted set per key, scored by timestamp.
///
/// Trim, insert, count and expiry run in a single MULTI/EXEC pipeline so
/// concurrent gateways see consistent counts.
pub struct RedisRateLimitStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    prefix: String,
}

impl RedisRateLimitStore {
    pub fn new(url: &str) -> Result<Self, RateLimitStoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            prefix: "nachos:ratelimit:".into(),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, RateLimitStoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| RateLimitStoreError::Unavailable {
                store: STORE,
                message: e.to_string(),
            })?;
        debug!("redis rate-limit store connected");
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.conn.lock().await = None;
    }
}

fn backend(e: redis::RedisError) -> RateLimitStoreError {
    RateLimitStoreError::Backend {
        store: STORE,
        message: e.to_string(),
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    fn name(&self) -> &'static str {
        STORE
    }

    async fn record(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, RateLimitStoreError> {
        let mut conn = self.connection().await?;
        let key = format!("{}{key}", self.prefix);
        let member = format!("{now_ms}-{}", uuid::Uuid::new_v4());
        let cutoff = now_ms.saturating_sub(window_ms);

        let result: Result<(u64,), _> = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&key)
            .arg("-inf")
            .arg(cutoff)
            .ignore()
            .cmd("ZADD")
            .arg(&key)
            .arg(now_ms)
            .arg(&member)
            .ignore()
            .cmd("ZCARD")
            .arg(&key)
            .cmd("PEXPIRE")
            .arg(&key)
            .arg(window_ms)
            .ignore()
            .query_async(&mut conn)
            .await;

        match result {
            Ok((count,)) => Ok(count),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.reset().await;
                }
                Err(backend(e))
            },
        }
    }

    async fn health(&self) -> Result<(), RateLimitStoreError> {
        let mut conn = self.connection().await?;
        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn close(&self) {
        self.reset().await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_url() {
        assert!(RedisRateLimitStore::new("not a url").is_err());
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let store = RedisRateLimitStore::new("redis://127.0.0.1:1/").unwrap();
        assert!(store.record("k", 0, 1_000).await.is_err());
    }
}
