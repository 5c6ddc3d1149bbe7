//! Single-table encoding of the cart aggregate.
//!
//! Each cart is exactly one row keyed `(PK = "USER#<user_id>",
//! SK = "CART#<user_id>")`. The duplicated user id leaves the sort key
//! free for future per-item rows without a schema change. Nothing outside
//! this module may depend on the row shape.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::domain::{Cart, CartItem};
use crate::errors::ApiError;
use crate::kv::{row_version, DeleteCondition, KvError, KvKey, KvRow, KvStore, PutCondition};

const RECORD_TYPE_CART: &str = "CART";

/// Sentinel reported as `current_version` when the follow-up read after a
/// conditional-check failure also fails.
const UNKNOWN_VERSION: i64 = 0;

pub struct KvCartRepository {
    store: Arc<dyn KvStore>,
    table: String,
}

impl KvCartRepository {
    pub fn new(store: Arc<dyn KvStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    fn cart_key(user_id: &str) -> KvKey {
        KvKey::new(format!("USER#{user_id}"), format!("CART#{user_id}"))
    }

    fn encode(cart: &Cart) -> Result<KvRow, ApiError> {
        let record = CartRecord {
            record_type: RECORD_TYPE_CART.to_string(),
            id: cart.id,
            user_id: cart.user_id.clone(),
            items: cart.items.iter().map(ItemRecord::from).collect(),
            version: cart.version,
            created_at: cart.created_at.to_rfc3339(),
            updated_at: cart.updated_at.to_rfc3339(),
            expires_at: cart.expires_at.to_rfc3339(),
        };
        let attributes = serde_json::to_value(record).map_err(ApiError::persistence)?;
        Ok(KvRow {
            key: Self::cart_key(&cart.user_id),
            attributes,
            ttl: Some(cart.expires_at.timestamp()),
        })
    }

    fn decode(row: KvRow) -> Result<Cart, ApiError> {
        let record: CartRecord =
            serde_json::from_value(row.attributes).map_err(ApiError::persistence)?;
        Ok(Cart {
            id: record.id,
            user_id: record.user_id,
            items: record
                .items
                .into_iter()
                .map(ItemRecord::into_item)
                .collect::<Result<_, _>>()?,
            version: record.version,
            created_at: parse_timestamp(&record.created_at)?,
            updated_at: parse_timestamp(&record.updated_at)?,
            expires_at: parse_timestamp(&record.expires_at)?,
        })
    }

    /// Populates `current_version` for a conflict by re-reading the row.
    /// A failed follow-up read degrades to the sentinel version.
    async fn current_version(&self, user_id: &str) -> i64 {
        match self.store.get_item(&Self::cart_key(user_id)).await {
            Ok(Some(row)) => row_version(&row).unwrap_or(UNKNOWN_VERSION),
            Ok(None) => UNKNOWN_VERSION,
            Err(err) => {
                warn!(
                    table = %self.table,
                    user_id,
                    error = %err,
                    "conflict follow-up read failed"
                );
                UNKNOWN_VERSION
            }
        }
    }
}

#[async_trait]
impl super::CartRepository for KvCartRepository {
    async fn get_cart(&self, user_id: &str) -> Result<Cart, ApiError> {
        match self.store.get_item(&Self::cart_key(user_id)).await {
            Ok(Some(row)) => Self::decode(row),
            Ok(None) => Err(ApiError::CartNotFound {
                user_id: user_id.to_string(),
            }),
            Err(err) => Err(ApiError::persistence(err)),
        }
    }

    async fn save_cart(&self, cart: &Cart) -> Result<(), ApiError> {
        let row = Self::encode(cart)?;
        self.store
            .put_item(row, PutCondition::None)
            .await
            .map_err(ApiError::persistence)
    }

    async fn save_cart_with_version(
        &self,
        cart: &Cart,
        expected_version: i64,
    ) -> Result<(), ApiError> {
        let row = Self::encode(cart)?;
        match self
            .store
            .put_item(row, PutCondition::NotExistsOrVersion(expected_version))
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionFailed) => Err(ApiError::Conflict {
                expected_version,
                current_version: self.current_version(&cart.user_id).await,
            }),
            Err(err) => Err(ApiError::persistence(err)),
        }
    }

    async fn delete_cart(&self, user_id: &str) -> Result<(), ApiError> {
        match self
            .store
            .delete_item(&Self::cart_key(user_id), DeleteCondition::Exists)
            .await
        {
            Ok(()) => Ok(()),
            Err(KvError::ConditionFailed) => Err(ApiError::CartNotFound {
                user_id: user_id.to_string(),
            }),
            Err(err) => Err(ApiError::persistence(err)),
        }
    }

    async fn health_check(&self) -> Result<(), ApiError> {
        self.store.ping().await.map_err(ApiError::persistence)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CartRecord {
    #[serde(rename = "type")]
    record_type: String,
    id: Uuid,
    user_id: String,
    items: Vec<ItemRecord>,
    version: i64,
    created_at: String,
    updated_at: String,
    expires_at: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ItemRecord {
    item_id: Uuid,
    product_id: String,
    quantity: i32,
    unit_price: i64,
    added_at: String,
}

impl From<&CartItem> for ItemRecord {
    fn from(item: &CartItem) -> Self {
        Self {
            item_id: item.item_id,
            product_id: item.product_id.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            added_at: item.added_at.to_rfc3339(),
        }
    }
}

impl ItemRecord {
    fn into_item(self) -> Result<CartItem, ApiError> {
        Ok(CartItem {
            item_id: self.item_id,
            product_id: self.product_id,
            quantity: self.quantity,
            unit_price: self.unit_price,
            added_at: parse_timestamp(&self.added_at)?,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(ApiError::persistence)
}
