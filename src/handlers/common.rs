use async_trait::async_trait;
use axum::extract::{FromRequest, Request};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use validator::Validate;

use crate::errors::ApiError;

/// User and product identifiers: opaque, at most 64 chars.
pub static ID_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("static pattern"));

pub const MAX_ID_LENGTH: usize = 64;

/// Validates a path-supplied user or guest id.
pub fn validate_user_id(user_id: &str) -> Result<(), ApiError> {
    if user_id.is_empty() || user_id.len() > MAX_ID_LENGTH || !ID_PATTERN.is_match(user_id) {
        return Err(ApiError::validation(
            "user id must be 1-64 characters of [A-Za-z0-9_-]",
        ));
    }
    Ok(())
}

pub fn validate_input<T: Validate>(input: &T) -> Result<(), ApiError> {
    input.validate().map_err(ApiError::from)
}

/// JSON extractor whose rejection is the service's own error body
/// instead of axum's plain-text default.
pub struct AppJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for AppJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match axum::Json::<T>::from_request(req, state).await {
            Ok(axum::Json(value)) => Ok(AppJson(value)),
            Err(rejection) => Err(ApiError::validation(rejection.body_text())),
        }
    }
}
