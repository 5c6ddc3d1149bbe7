//! Per-client token-bucket rate limiting.
//!
//! Buckets are keyed by client identity (forwarded-for address, else the
//! cart user id in the path, else a shared key) and refill continuously
//! at the configured request rate up to the burst capacity.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use metrics::counter;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::errors::ApiError;

const LIMIT_HEADER: &str = "x-ratelimit-limit";
const REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Buckets beyond this count trigger an inline cleanup of stale entries.
const CLEANUP_WATERMARK: usize = 10_000;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, Bucket>,
    rate_per_sec: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            rate_per_sec: f64::from(rate_per_sec.max(1)),
            burst: f64::from(burst.max(1)),
        }
    }

    /// Takes one token for `key`. On rejection returns the seconds until
    /// a token becomes available.
    pub fn check(&self, key: &str) -> Result<u32, u64> {
        self.maybe_cleanup();

        let now = Instant::now();
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(bucket.tokens as u32)
        } else {
            let wait = (1.0 - bucket.tokens) / self.rate_per_sec;
            Err(wait.ceil() as u64)
        }
    }

    pub fn limit(&self) -> u32 {
        self.burst as u32
    }

    fn maybe_cleanup(&self) {
        if self.buckets.len() > CLEANUP_WATERMARK {
            let now = Instant::now();
            self.buckets.retain(|_, bucket| {
                now.duration_since(bucket.last_refill).as_secs_f64() * self.rate_per_sec
                    < self.burst
            });
        }
    }
}

fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return format!("ip:{forwarded}");
    }

    // Fall back to the cart owner in the path so one user cannot starve
    // the rest when no client address is visible.
    let path = request.uri().path();
    if let Some(user) = path_user_segment(path) {
        return format!("user:{user}");
    }
    "global".to_string()
}

pub(crate) fn path_user_segment(path: &str) -> Option<&str> {
    let mut segments = path.split('/').filter(|s| !s.is_empty());
    while let Some(segment) = segments.next() {
        if segment == "cart" {
            return segments.next().filter(|s| !s.is_empty());
        }
    }
    None
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);
    match limiter.check(&key) {
        Ok(remaining) => {
            let mut response = next.run(request).await;
            set_header(&mut response, LIMIT_HEADER, limiter.limit().to_string());
            set_header(&mut response, REMAINING_HEADER, remaining.to_string());
            response
        }
        Err(retry_after_secs) => {
            counter!("rate_limiter.rejected_total", 1);
            warn!(%key, retry_after_secs, "rate limit exceeded");
            let mut response = ApiError::RateLimited { retry_after_secs }.into_response();
            set_header(&mut response, LIMIT_HEADER, limiter.limit().to_string());
            set_header(&mut response, REMAINING_HEADER, "0".to_string());
            response
        }
    }
}

fn set_header(response: &mut Response, name: &'static str, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(name), value);
    }
}
