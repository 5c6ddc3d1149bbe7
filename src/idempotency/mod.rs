//! Keyed response-snapshot store backing the idempotency middleware.
//!
//! A snapshot records the status, headers, and body of the first
//! successful response for a key; replays return it verbatim. Keys expire
//! after a configurable TTL (24h by default).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod redis_store;

pub use redis_store::RedisIdempotencyStore;

/// How often the in-memory sweeper removes expired records.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("idempotency store failure: {0}")]
    Store(String),

    #[error("snapshot serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Response snapshot plus the fingerprint of the request that produced
/// it. A key replayed with a different fingerprint is a client error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub request_method: String,
    pub request_path: String,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn matches_request(&self, method: &str, path: &str) -> bool {
        self.request_method == method && self.request_path == path
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError>;
    async fn set(
        &self,
        key: &str,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    record: IdempotencyRecord,
    expires_at: Instant,
}

/// In-memory store: a map behind a reader/writer lock plus a background
/// sweeper that clears expired records every [`SWEEP_INTERVAL`].
#[derive(Debug, Default)]
pub struct MemoryIdempotencyStore {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes expired records; returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        let before = records.len();
        records.retain(|_, stored| stored.expires_at > now);
        let swept = before - records.len();
        if swept > 0 {
            debug!(swept, "idempotency sweeper removed expired records");
        }
        swept
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        let records = self.records.read().unwrap_or_else(|p| p.into_inner());
        Ok(records
            .get(key)
            .filter(|stored| stored.expires_at > Instant::now())
            .map(|stored| stored.record.clone()))
    }

    async fn set(
        &self,
        key: &str,
        record: IdempotencyRecord,
        ttl: Duration,
    ) -> Result<(), IdempotencyError> {
        let mut records = self.records.write().unwrap_or_else(|p| p.into_inner());
        records.insert(
            key.to_string(),
            StoredRecord {
                record,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }
}

/// Runs the sweeper loop for an in-memory store until aborted.
pub fn spawn_sweeper(store: Arc<MemoryIdempotencyStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval = ?interval, "idempotency sweeper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            store.sweep();
        }
    })
}

/// Builds the configured store backend, falling back to memory when the
/// Redis backend is requested but unreachable.
pub async fn build_store(
    backend: &str,
    redis_url: Option<&str>,
) -> (Arc<dyn IdempotencyStore>, Option<Arc<MemoryIdempotencyStore>>) {
    if backend.eq_ignore_ascii_case("redis") {
        if let Some(url) = redis_url {
            match RedisIdempotencyStore::connect(url).await {
                Ok(store) => {
                    info!("using redis idempotency store");
                    return (Arc::new(store), None);
                }
                Err(err) => {
                    warn!(error = %err, "redis idempotency store unavailable, falling back to memory");
                }
            }
        } else {
            warn!("redis idempotency backend selected without a redis url, using memory");
        }
    }
    let memory = Arc::new(MemoryIdempotencyStore::new());
    (memory.clone(), Some(memory))
}
