//! Idempotency middleware.
//!
//! For POST and PATCH requests carrying an `Idempotency-Key` header the
//! first 2xx response is snapshotted; replays within the TTL return the
//! stored status, headers, and body verbatim with
//! `X-Idempotent-Replayed: true` added. Non-2xx responses are never
//! cached so a client may retry toward a different outcome.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::ApiError;
use crate::idempotency::{IdempotencyRecord, IdempotencyStore};
use crate::middleware::rate_limit::path_user_segment;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const REPLAYED_HEADER: &str = "x-idempotent-replayed";

#[derive(Clone)]
pub struct IdempotencyLayerState {
    pub store: Arc<dyn IdempotencyStore>,
    pub ttl: Duration,
    pub enabled: bool,
    /// Strict mode: state-changing requests without the header are
    /// rejected instead of bypassing the cache.
    pub required: bool,
}

pub async fn idempotency_middleware(
    State(layer): State<IdempotencyLayerState>,
    request: Request,
    next: Next,
) -> Response {
    if !layer.enabled || !is_cacheable_method(request.method()) {
        return next.run(request).await;
    }

    let header_key = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let Some(header_key) = header_key else {
        if layer.required {
            return ApiError::validation("Idempotency-Key header is required").into_response();
        }
        return next.run(request).await;
    };

    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let scope = path_user_segment(&path).unwrap_or("anonymous");
    let key = format!("{scope}:{header_key}");

    match layer.store.get(&key).await {
        Ok(Some(record)) => {
            if !record.matches_request(&method, &path) {
                return ApiError::IdempotencyConflict { key: header_key }.into_response();
            }
            debug!(%key, "replaying idempotent response");
            return replay(record);
        }
        Ok(None) => {}
        Err(err) => {
            // A broken cache must not fail the request; skip replay and
            // let the call through.
            warn!(error = %err, "idempotency lookup failed");
        }
    }

    let response = next.run(request).await;
    capture(&layer, key, method, path, response).await
}

fn is_cacheable_method(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PATCH)
}

fn replay(record: IdempotencyRecord) -> Response {
    let status = StatusCode::from_u16(record.status).unwrap_or(StatusCode::OK);
    let mut response = Response::new(Body::from(record.body));
    *response.status_mut() = status;
    for (name, value) in &record.headers {
        if let (Ok(name), Ok(value)) = (
            name.parse::<HeaderName>(),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    response.headers_mut().insert(
        HeaderName::from_static(REPLAYED_HEADER),
        HeaderValue::from_static("true"),
    );
    response
}

async fn capture(
    layer: &IdempotencyLayerState,
    key: String,
    method: String,
    path: String,
    response: Response,
) -> Response {
    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return Response::from_parts(parts, Body::empty()),
    };

    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();

    let record = IdempotencyRecord {
        status: parts.status.as_u16(),
        headers,
        body: bytes.to_vec(),
        request_method: method,
        request_path: path,
        created_at: chrono::Utc::now(),
    };

    if let Err(err) = layer.store.set(&key, record, layer.ttl).await {
        warn!(error = %err, "failed to store idempotency snapshot");
    }

    Response::from_parts(parts, Body::from(bytes))
}
