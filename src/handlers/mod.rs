use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::app::AppState;
use crate::middleware::{
    idempotency_middleware, rate_limit_middleware, recovery::panic_response,
    request_context_middleware,
};

pub mod carts;
pub mod common;
pub mod health;

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not Found" })))
}

/// Assembles the full router: health endpoints, the cart API, and the
/// cross-cutting middleware pipeline.
pub fn router(state: AppState) -> Router {
    let application = state.application.clone();
    let idempotency = application.idempotency_layer();
    let rate_limiter = application.rate_limiter.clone();
    let max_request_size = application.config.max_request_size;

    Router::new()
        .route("/health", get(health::health))
        .route("/ready", get(health::ready))
        .nest("/v1/cart", carts::routes())
        .fallback(not_found)
        .layer(axum::middleware::from_fn_with_state(
            idempotency,
            idempotency_middleware,
        ))
        .layer(axum::middleware::from_fn_with_state(
            rate_limiter,
            rate_limit_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(max_request_size))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(axum::middleware::from_fn(request_context_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}
