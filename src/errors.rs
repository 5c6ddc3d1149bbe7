use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{error, warn};

/// Boxed cause attached to transport-level failures. Causes are logged,
/// never serialized into a response body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Closed taxonomy of service failures. Every variant carries a stable
/// string code and a fixed HTTP status mapping.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("cart not found for user")]
    CartNotFound { user_id: String },

    #[error("item not found in cart")]
    ItemNotFound { item_id: String },

    #[error("cart cannot hold more than {max_items} items")]
    CartLimitExceeded { max_items: usize },

    #[error("item quantity cannot exceed {max_quantity}")]
    QuantityLimitExceeded { requested: i64, max_quantity: i32 },

    #[error("item quantity must be at least 1")]
    InvalidQuantity { requested: i64 },

    #[error("cart has expired")]
    CartExpired { user_id: String },

    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: Option<Value>,
    },

    #[error("cart version conflict")]
    Conflict {
        expected_version: i64,
        current_version: i64,
    },

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("idempotency key reused with a different request")]
    IdempotencyConflict { key: String },

    #[error("persistence failure")]
    Persistence(#[source] BoxError),

    #[error("event publish failure")]
    EventPublish(#[source] BoxError),

    #[error("{resource} is unavailable")]
    ServiceUnavailable { resource: String },

    #[error("internal error")]
    Internal(#[source] BoxError),
}

impl ApiError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
            details: None,
        }
    }

    pub fn persistence(cause: impl Into<BoxError>) -> Self {
        Self::Persistence(cause.into())
    }

    pub fn internal(cause: impl Into<BoxError>) -> Self {
        Self::Internal(cause.into())
    }

    /// Stable machine-readable code carried in every error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CartNotFound { .. } => "CART_NOT_FOUND",
            Self::ItemNotFound { .. } => "ITEM_NOT_FOUND",
            Self::CartLimitExceeded { .. } => "CART_LIMIT_EXCEEDED",
            Self::QuantityLimitExceeded { .. } => "QUANTITY_LIMIT_EXCEEDED",
            Self::InvalidQuantity { .. } => "INVALID_QUANTITY",
            Self::CartExpired { .. } => "CART_EXPIRED",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Conflict { .. } => "CONFLICT",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Forbidden => "FORBIDDEN",
            Self::IdempotencyConflict { .. } => "IDEMPOTENCY_CONFLICT",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::EventPublish(_) => "EVENT_PUBLISH_ERROR",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::CartNotFound { .. } | Self::ItemNotFound { .. } => StatusCode::NOT_FOUND,
            Self::CartLimitExceeded { .. }
            | Self::QuantityLimitExceeded { .. }
            | Self::InvalidQuantity { .. }
            | Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::CartExpired { .. } => StatusCode::GONE,
            Self::Conflict { .. } | Self::IdempotencyConflict { .. } => StatusCode::CONFLICT,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::Persistence(_) | Self::EventPublish(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Structured details for the response body. Never includes cause text.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::CartNotFound { user_id } => Some(json!({ "user_id": user_id })),
            Self::ItemNotFound { item_id } => Some(json!({ "item_id": item_id })),
            Self::CartLimitExceeded { max_items } => Some(json!({ "max_items": max_items })),
            Self::QuantityLimitExceeded {
                requested,
                max_quantity,
            } => Some(json!({ "requested": requested, "max_quantity": max_quantity })),
            Self::InvalidQuantity { requested } => Some(json!({ "requested": requested })),
            Self::CartExpired { user_id } => Some(json!({ "user_id": user_id })),
            Self::Validation { details, .. } => details.clone(),
            Self::Conflict {
                expected_version,
                current_version,
            } => Some(json!({
                "expected_version": expected_version,
                "current_version": current_version,
            })),
            Self::RateLimited { retry_after_secs } => {
                Some(json!({ "retry_after_secs": retry_after_secs }))
            }
            Self::IdempotencyConflict { key } => Some(json!({ "idempotency_key": key })),
            Self::ServiceUnavailable { resource } => Some(json!({ "resource": resource })),
            _ => None,
        }
    }

    /// Whether the resilience envelope may retry the failed call.
    /// Conflicts are never retried here; the caller decides.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_) | Self::EventPublish(_))
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let details = serde_json::to_value(errors.field_errors()).ok();
        Self::Validation {
            message: "request validation failed".to_string(),
            details,
        }
    }
}

/// Wire shape of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            ApiError::Persistence(_) | ApiError::EventPublish(_) | ApiError::Internal(_) => {
                error!(code = self.code(), cause = ?self, "request failed");
            }
            _ => warn!(code = self.code(), "request rejected: {}", self),
        }

        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
            details: self.details(),
        };

        let mut response = (status, Json(body)).into_response();
        if let ApiError::RateLimited { retry_after_secs } = &self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
