//! Request-scoped correlation values.
//!
//! Every request gets a [`RequestContext`] holding its request id, trace
//! id, and correlation id, stored in the request extensions and echoed on
//! the tracing span. Handlers extract it and thread it into event
//! metadata.

use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::convert::Infallible;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::events::EventMetadata;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const TRACE_ID_HEADER: &str = "x-amzn-trace-id";
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
}

impl RequestContext {
    fn from_parts(parts: &Parts) -> Self {
        let header = |name: &str| {
            parts
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
        };
        Self {
            request_id: header(REQUEST_ID_HEADER).unwrap_or_else(|| Uuid::new_v4().to_string()),
            trace_id: header(TRACE_ID_HEADER),
            correlation_id: header(CORRELATION_ID_HEADER),
        }
    }

    pub fn event_metadata(&self, user_id: impl Into<String>) -> EventMetadata {
        EventMetadata {
            trace_id: self.trace_id.clone(),
            correlation_id: self
                .correlation_id
                .clone()
                .or_else(|| Some(self.request_id.clone())),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for RequestContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ctx) = parts.extensions.get::<RequestContext>() {
            return Ok(ctx.clone());
        }
        Ok(Self::from_parts(parts))
    }
}

/// Assigns the request context, opens the request span, and echoes
/// `X-Request-ID` on the response.
pub async fn request_context_middleware(mut request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = RequestContext::from_parts(&parts);
    request = Request::from_parts(parts, body);
    request.extensions_mut().insert(ctx.clone());

    let span = info_span!(
        "request",
        request_id = %ctx.request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}
