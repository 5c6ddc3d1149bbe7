//! Typed cart events and the publisher port.
//!
//! Publication is best-effort and never transactional with the
//! persistence write: a failed publish is logged and discarded so a
//! successful store write is never reversed by a flaky bus.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::CartItem;

/// `source` field stamped on every envelope.
pub const EVENT_SOURCE: &str = "cart-service";
/// Payload schema version stamped on every envelope.
pub const DATA_VERSION: &str = "1.0";
/// Batch publishes are chunked into groups of at most this many entries.
pub const MAX_PUBLISH_BATCH: usize = 10;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event channel closed")]
    ChannelClosed,

    #[error("event publish failed: {0}")]
    Publish(String),
}

/// Request-scoped correlation fields carried on every envelope.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub user_id: String,
}

/// Wire envelope published to the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub source: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub time: DateTime<Utc>,
    pub data: Value,
    pub metadata: EventMetadata,
    pub data_version: String,
}

/// Domain events emitted by the cart service. Serialized untagged so the
/// variant fields become the envelope's `data` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CartEvent {
    Created {
        cart_id: Uuid,
        user_id: String,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    ItemAdded {
        cart_id: Uuid,
        user_id: String,
        item: CartItem,
        cart_total: i64,
        item_count: usize,
    },
    ItemRemoved {
        cart_id: Uuid,
        user_id: String,
        item_id: Uuid,
        cart_total: i64,
        item_count: usize,
    },
    ItemUpdated {
        cart_id: Uuid,
        user_id: String,
        item: CartItem,
        cart_total: i64,
    },
    Cleared {
        cart_id: Uuid,
        user_id: String,
    },
    Abandoned {
        cart_id: Uuid,
        user_id: String,
        item_count: usize,
        cart_total: i64,
        last_updated: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
}

impl CartEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Created { .. } => "cart.created",
            Self::ItemAdded { .. } => "cart.item_added",
            Self::ItemRemoved { .. } => "cart.item_removed",
            Self::ItemUpdated { .. } => "cart.item_updated",
            Self::Cleared { .. } => "cart.cleared",
            Self::Abandoned { .. } => "cart.abandoned",
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Created { user_id, .. }
            | Self::ItemAdded { user_id, .. }
            | Self::ItemRemoved { user_id, .. }
            | Self::ItemUpdated { user_id, .. }
            | Self::Cleared { user_id, .. }
            | Self::Abandoned { user_id, .. } => user_id,
        }
    }

    pub fn into_envelope(self, mut metadata: EventMetadata) -> EventEnvelope {
        if metadata.user_id.is_empty() {
            metadata.user_id = self.user_id().to_string();
        }
        let event_type = self.event_type().to_string();
        let data = serde_json::to_value(&self).unwrap_or(Value::Null);
        EventEnvelope {
            id: Uuid::new_v4(),
            source: EVENT_SOURCE.to_string(),
            event_type,
            time: Utc::now(),
            data,
            metadata,
            data_version: DATA_VERSION.to_string(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError>;

    /// Publishes a batch in chunks of [`MAX_PUBLISH_BATCH`]. Individual
    /// failures are logged and tolerated; the returned count is how many
    /// entries were accepted by the bus.
    async fn publish_batch(&self, events: Vec<EventEnvelope>) -> Result<usize, EventError> {
        let total = events.len();
        let mut published = 0;
        for chunk in events.chunks(MAX_PUBLISH_BATCH) {
            let results = join_all(chunk.iter().cloned().map(|event| self.publish(event))).await;
            for result in results {
                match result {
                    Ok(()) => published += 1,
                    Err(err) => warn!(error = %err, "dropping event from failed batch entry"),
                }
            }
        }
        if published < total {
            warn!(published, total, "batch publish completed partially");
        }
        Ok(published)
    }
}

/// Publisher backed by an in-process channel; a background consumer
/// drains the receiver. Stands in for the hosted bus in local runs and
/// tests while keeping the same fire-and-forget contract.
#[derive(Debug, Clone)]
pub struct ChannelEventPublisher {
    sender: mpsc::Sender<EventEnvelope>,
}

impl ChannelEventPublisher {
    pub fn new(sender: mpsc::Sender<EventEnvelope>) -> Self {
        Self { sender }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }
}

#[async_trait]
impl EventPublisher for ChannelEventPublisher {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| EventError::ChannelClosed)
    }
}

/// Publisher used when the bus is disabled by configuration.
#[derive(Debug, Default, Clone)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, event: EventEnvelope) -> Result<(), EventError> {
        debug!(event_type = %event.event_type, "event bus disabled, dropping event");
        Ok(())
    }
}

/// Drains published envelopes, logging each one. Ends when every sender
/// is dropped.
pub fn spawn_event_consumer(mut rx: mpsc::Receiver<EventEnvelope>) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("event consumer started");
        while let Some(event) = rx.recv().await {
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                user_id = %event.metadata.user_id,
                "event published"
            );
        }
        info!("event consumer stopped");
    })
}
