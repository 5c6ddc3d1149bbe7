pub mod app;
pub mod config;
pub mod domain;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod idempotency;
pub mod kv;
pub mod middleware;
pub mod repository;
pub mod resilience;
pub mod services;

pub use app::{AppState, Application};
pub use errors::ApiError;
pub use services::CartService;
