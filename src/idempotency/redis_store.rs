use async_trait::async_trait;
use std::time::Duration;

use super::{IdempotencyError, IdempotencyRecord, IdempotencyStore};

const KEY_PREFIX: &str = "cart:idem:";

/// Redis-backed idempotency store for multi-instance deployments.
/// Snapshots are stored as JSON under `SETEX`-managed keys so Redis owns
/// the TTL.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    client: redis::Client,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str) -> Result<Self, IdempotencyError> {
        let client =
            redis::Client::open(redis_url).map_err(|e| IdempotencyError::Store(e.to_string()))?;

        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| IdempotencyError::Store(format!("failed to connect: {e}")))?;

        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Store(format!("connection test failed: {e}")))?;

        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, IdempotencyError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| IdempotencyError::Store(e.to_string()))
    }

    fn storage_key(key: &str) -> String {
        format!("{KEY_PREFIX}{key}")
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let mut conn = self.connection().await?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(Self::storage_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Store(e.to_string()))?;

        match payload {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let payload = serde_json::to_string(&record)?;
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.connection().await?;
        redis::cmd("SETEX")
            .arg(Self::storage_key(key))
            .arg(ttl_secs)
            .arg(payload)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| IdempotencyError::Store(e.to_string()))?;
        Ok(())
    }
}
