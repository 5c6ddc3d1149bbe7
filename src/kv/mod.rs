//! Single-table key-value store port.
//!
//! One logical table holds every row, addressed by a composite
//! partition/sort key. The port only requires what the service relies on:
//! point reads, conditional single-row writes, conditional deletes, and a
//! liveness ping. A strongly consistent in-memory engine backs local runs
//! and tests; a hosted document store slots in behind the same trait.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KvError {
    /// The conditional expression on a put or delete did not hold.
    #[error("conditional check failed")]
    ConditionFailed,

    #[error("kv transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KvKey {
    pub pk: String,
    pub sk: String,
}

impl KvKey {
    pub fn new(pk: impl Into<String>, sk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            sk: sk.into(),
        }
    }
}

/// One stored row: key, document attributes, and an optional expiry used
/// by store-driven reaping (unix seconds).
#[derive(Debug, Clone)]
pub struct KvRow {
    pub key: KvKey,
    pub attributes: Value,
    pub ttl: Option<i64>,
}

/// Condition attached to a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional upsert.
    None,
    /// Succeeds iff no row exists under the key OR the stored row's
    /// numeric `version` attribute equals the expected value.
    NotExistsOrVersion(i64),
}

/// Condition attached to a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteCondition {
    None,
    /// Succeeds iff a row exists under the key.
    Exists,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_item(&self, key: &KvKey) -> Result<Option<KvRow>, KvError>;
    async fn put_item(&self, row: KvRow, condition: PutCondition) -> Result<(), KvError>;
    async fn delete_item(&self, key: &KvKey, condition: DeleteCondition) -> Result<(), KvError>;
    async fn ping(&self) -> Result<(), KvError>;
}

/// Reads the numeric `version` attribute of a row, if present.
pub fn row_version(row: &KvRow) -> Option<i64> {
    row.attributes.get("version").and_then(Value::as_i64)
}

/// In-memory single-table engine. Conditional writes are evaluated under
/// one writer lock, which gives the same single-row strong consistency
/// the hosted store guarantees. Rows are deep-copied on both read and
/// write so callers can never alias store state.
///
/// TTL reaping is a separate maintenance pass, the way the hosted store
/// runs it: rows past their `ttl` stay visible (and keep guarding
/// conditional writes) until [`MemoryKvStore::sweep_expired`] runs.
/// Callers own expiry checks on read.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    rows: RwLock<HashMap<KvKey, KvRow>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes rows whose `ttl` has passed; returns how many were reaped.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now().timestamp();
        let mut rows = self.rows.write().unwrap_or_else(|p| p.into_inner());
        let before = rows.len();
        rows.retain(|_, row| !matches!(row.ttl, Some(ttl) if ttl <= now));
        before - rows.len()
    }

    pub fn len(&self) -> usize {
        self.rows.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get_item(&self, key: &KvKey) -> Result<Option<KvRow>, KvError> {
        let rows = self.rows.read().unwrap_or_else(|p| p.into_inner());
        Ok(rows.get(key).cloned())
    }

    async fn put_item(&self, row: KvRow, condition: PutCondition) -> Result<(), KvError> {
        let mut rows = self.rows.write().unwrap_or_else(|p| p.into_inner());
        if let PutCondition::NotExistsOrVersion(expected) = condition {
            if let Some(existing) = rows.get(&row.key) {
                if row_version(existing) != Some(expected) {
                    return Err(KvError::ConditionFailed);
                }
            }
        }
        rows.insert(row.key.clone(), row);
        Ok(())
    }

    async fn delete_item(&self, key: &KvKey, condition: DeleteCondition) -> Result<(), KvError> {
        let mut rows = self.rows.write().unwrap_or_else(|p| p.into_inner());
        if condition == DeleteCondition::Exists && !rows.contains_key(key) {
            return Err(KvError::ConditionFailed);
        }
        rows.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
