pub mod context;
pub mod idempotency;
pub mod rate_limit;
pub mod recovery;

pub use context::{request_context_middleware, RequestContext, REQUEST_ID_HEADER};
pub use idempotency::{idempotency_middleware, IdempotencyLayerState, IDEMPOTENCY_KEY_HEADER};
pub use rate_limit::{rate_limit_middleware, RateLimiter};
