use async_trait::async_trait;

use crate::domain::Cart;
use crate::errors::ApiError;

pub mod kv;

pub use kv::KvCartRepository;

/// Persistence contract for the cart aggregate.
///
/// `save_cart_with_version` is the optimistic-concurrency write: it
/// succeeds iff the stored row still carries `expected_version` (or no
/// row exists), and fails with [`ApiError::Conflict`] carrying the
/// currently stored version otherwise.
#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn get_cart(&self, user_id: &str) -> Result<Cart, ApiError>;

    /// Unconditional upsert.
    async fn save_cart(&self, cart: &Cart) -> Result<(), ApiError>;

    async fn save_cart_with_version(
        &self,
        cart: &Cart,
        expected_version: i64,
    ) -> Result<(), ApiError>;

    /// Fails with [`ApiError::CartNotFound`] when no row exists; callers
    /// that want idempotent deletes treat that as success.
    async fn delete_cart(&self, user_id: &str) -> Result<(), ApiError>;

    async fn health_check(&self) -> Result<(), ApiError>;
}
