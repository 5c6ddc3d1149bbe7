use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{merge_carts, Cart, CartItem};
use crate::errors::ApiError;
use crate::events::{CartEvent, EventMetadata, EventPublisher};
use crate::middleware::RequestContext;
use crate::repository::CartRepository;
use crate::resilience::{OperationClass, ResiliencePipeline};

/// Resource name the persistence bulkhead and breaker are keyed by.
pub const STORE_RESOURCE: &str = "cart-store";
/// Resource name the event-bus bulkhead and breaker are keyed by.
pub const EVENTS_RESOURCE: &str = "cart-events";

/// Orchestrates the cart domain, the versioned persistence protocol, and
/// best-effort event publication. Safe to share across request tasks.
#[derive(Clone)]
pub struct CartService {
    repository: Arc<dyn CartRepository>,
    events: Arc<dyn EventPublisher>,
    resilience: Arc<ResiliencePipeline>,
}

impl CartService {
    pub fn new(
        repository: Arc<dyn CartRepository>,
        events: Arc<dyn EventPublisher>,
        resilience: Arc<ResiliencePipeline>,
    ) -> Self {
        Self {
            repository,
            events,
            resilience,
        }
    }

    /// Loads a cart. An expired cart surfaces as `CART_EXPIRED` after a
    /// best-effort `cart.abandoned` event.
    #[instrument(skip(self, ctx))]
    pub async fn get_cart(&self, ctx: &RequestContext, user_id: &str) -> Result<Cart, ApiError> {
        let cart = self.load(user_id).await?;
        if cart.is_expired() {
            self.publish_best_effort(
                CartEvent::Abandoned {
                    cart_id: cart.id,
                    user_id: cart.user_id.clone(),
                    item_count: cart.item_count(),
                    cart_total: cart.total_price(),
                    last_updated: cart.updated_at,
                    expires_at: cart.expires_at,
                },
                ctx.event_metadata(user_id),
            )
            .await;
            return Err(ApiError::CartExpired {
                user_id: user_id.to_string(),
            });
        }
        Ok(cart)
    }

    /// Loads a cart, creating and persisting a fresh one when none exists
    /// or the stored one has expired. The boolean reports creation.
    #[instrument(skip(self, ctx))]
    pub async fn get_or_create_cart(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<(Cart, bool), ApiError> {
        match self.get_cart(ctx, user_id).await {
            Ok(cart) => Ok((cart, false)),
            Err(ApiError::CartNotFound { .. }) | Err(ApiError::CartExpired { .. }) => {
                let cart = Cart::new(user_id);
                self.save(&cart).await?;
                info!(user_id, cart_id = %cart.id, "created cart");
                self.publish_best_effort(
                    CartEvent::Created {
                        cart_id: cart.id,
                        user_id: cart.user_id.clone(),
                        created_at: cart.created_at,
                        expires_at: cart.expires_at,
                    },
                    ctx.event_metadata(user_id),
                )
                .await;
                Ok((cart, true))
            }
            Err(err) => Err(err),
        }
    }

    /// Adds an item, folding duplicates by product id. Add is
    /// last-writer-wins: concurrent adds commute up to the quantity cap,
    /// so the save is unconditional.
    #[instrument(skip(self, ctx, item), fields(product_id = %item.product_id))]
    pub async fn add_item(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        item: CartItem,
    ) -> Result<Cart, ApiError> {
        let (mut cart, _) = self.get_or_create_cart(ctx, user_id).await?;
        let product_id = item.product_id.clone();
        cart.add_item(item)?;
        cart.increment_version();
        self.save(&cart).await?;

        if let Some(line) = cart.find_by_product(&product_id) {
            self.publish_best_effort(
                CartEvent::ItemAdded {
                    cart_id: cart.id,
                    user_id: cart.user_id.clone(),
                    item: line.clone(),
                    cart_total: cart.total_price(),
                    item_count: cart.item_count(),
                },
                ctx.event_metadata(user_id),
            )
            .await;
        }
        Ok(cart)
    }

    /// Version-checked quantity update. A caller-supplied
    /// `expected_version > 0` is compared before mutating; the
    /// conditional save enforces it again at the store. Conflicts surface
    /// unchanged so the caller can refetch and decide.
    #[instrument(skip(self, ctx))]
    pub async fn update_item_quantity(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        item_id: Uuid,
        quantity: i32,
        expected_version: i64,
    ) -> Result<Cart, ApiError> {
        let mut cart = self.get_cart(ctx, user_id).await?;
        if expected_version > 0 && expected_version != cart.version {
            return Err(ApiError::Conflict {
                expected_version,
                current_version: cart.version,
            });
        }

        cart.update_item_quantity(item_id, quantity)?;
        let snapshot = cart.version;
        cart.increment_version();
        self.save_versioned(&cart, snapshot).await?;

        if let Some(line) = cart.find_item(item_id) {
            self.publish_best_effort(
                CartEvent::ItemUpdated {
                    cart_id: cart.id,
                    user_id: cart.user_id.clone(),
                    item: line.clone(),
                    cart_total: cart.total_price(),
                },
                ctx.event_metadata(user_id),
            )
            .await;
        }
        Ok(cart)
    }

    #[instrument(skip(self, ctx))]
    pub async fn remove_item(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        item_id: Uuid,
    ) -> Result<Cart, ApiError> {
        let mut cart = self.get_cart(ctx, user_id).await?;
        cart.remove_item(item_id)?;
        cart.increment_version();
        self.save(&cart).await?;

        self.publish_best_effort(
            CartEvent::ItemRemoved {
                cart_id: cart.id,
                user_id: cart.user_id.clone(),
                item_id,
                cart_total: cart.total_price(),
                item_count: cart.item_count(),
            },
            ctx.event_metadata(user_id),
        )
        .await;
        Ok(cart)
    }

    /// Empties the cart. A missing cart is a silent no-op.
    #[instrument(skip(self, ctx))]
    pub async fn clear_cart(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<Option<Cart>, ApiError> {
        let mut cart = match self.get_cart(ctx, user_id).await {
            Ok(cart) => cart,
            Err(ApiError::CartNotFound { .. }) | Err(ApiError::CartExpired { .. }) => {
                return Ok(None)
            }
            Err(err) => return Err(err),
        };

        cart.clear();
        cart.increment_version();
        self.save(&cart).await?;

        self.publish_best_effort(
            CartEvent::Cleared {
                cart_id: cart.id,
                user_id: cart.user_id.clone(),
            },
            ctx.event_metadata(user_id),
        )
        .await;
        Ok(Some(cart))
    }

    /// Removes the stored row entirely. Idempotent: a missing cart counts
    /// as success.
    #[instrument(skip(self))]
    pub async fn delete_cart(&self, user_id: &str) -> Result<(), ApiError> {
        let repository = self.repository.clone();
        let owner = user_id.to_string();
        let result = self
            .resilience
            .execute(STORE_RESOURCE, OperationClass::Write, move || {
                let repository = repository.clone();
                let owner = owner.clone();
                async move { repository.delete_cart(&owner).await }
            })
            .await;

        match result {
            Ok(()) | Err(ApiError::CartNotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Folds a guest cart into the user's cart. The guest cart is deleted
    /// best-effort afterwards; merge itself is not version-checked.
    #[instrument(skip(self, ctx))]
    pub async fn merge_guest_cart(
        &self,
        ctx: &RequestContext,
        user_id: &str,
        guest_id: &str,
    ) -> Result<Cart, ApiError> {
        let (user_cart, _) = self.get_or_create_cart(ctx, user_id).await?;

        let guest_cart = match self.load(guest_id).await {
            Ok(cart) if !cart.is_expired() => Some(cart),
            Ok(_) | Err(ApiError::CartNotFound { .. }) => None,
            Err(err) => return Err(err),
        };
        let Some(guest_cart) = guest_cart else {
            debug!(user_id, guest_id, "no guest cart to merge");
            return Ok(user_cart);
        };

        let (merged, dropped) = merge_carts(Some(user_cart), Some(guest_cart));
        let mut cart = merged.unwrap_or_else(|| Cart::new(user_id));
        if dropped > 0 {
            warn!(user_id, guest_id, dropped, "merge dropped guest items past the cart limit");
        }
        cart.increment_version();
        self.save(&cart).await?;

        if let Err(err) = self.delete_cart(guest_id).await {
            warn!(guest_id, error = %err, "failed to delete guest cart after merge");
        }
        info!(user_id, guest_id, items = cart.item_count(), "merged guest cart");
        Ok(cart)
    }

    /// Pushes the cart's expiry window out without touching its contents.
    #[instrument(skip(self, ctx))]
    pub async fn touch_cart(&self, ctx: &RequestContext, user_id: &str) -> Result<Cart, ApiError> {
        let mut cart = self.get_cart(ctx, user_id).await?;
        cart.extend_expiration();
        self.save(&cart).await?;
        Ok(cart)
    }

    async fn load(&self, user_id: &str) -> Result<Cart, ApiError> {
        let repository = self.repository.clone();
        let owner = user_id.to_string();
        self.resilience
            .execute(STORE_RESOURCE, OperationClass::Read, move || {
                let repository = repository.clone();
                let owner = owner.clone();
                async move { repository.get_cart(&owner).await }
            })
            .await
    }

    async fn save(&self, cart: &Cart) -> Result<(), ApiError> {
        let repository = self.repository.clone();
        let cart = cart.clone();
        self.resilience
            .execute(STORE_RESOURCE, OperationClass::Write, move || {
                let repository = repository.clone();
                let cart = cart.clone();
                async move { repository.save_cart(&cart).await }
            })
            .await
    }

    async fn save_versioned(&self, cart: &Cart, expected_version: i64) -> Result<(), ApiError> {
        let repository = self.repository.clone();
        let cart = cart.clone();
        self.resilience
            .execute(STORE_RESOURCE, OperationClass::Write, move || {
                let repository = repository.clone();
                let cart = cart.clone();
                async move {
                    repository
                        .save_cart_with_version(&cart, expected_version)
                        .await
                }
            })
            .await
    }

    /// Best-effort publish: failures are logged and dropped so a
    /// successful store write is never reversed by the bus.
    async fn publish_best_effort(&self, event: CartEvent, metadata: EventMetadata) {
        let event_type = event.event_type();
        let events = self.events.clone();
        let envelope = event.into_envelope(metadata);
        let result = self
            .resilience
            .execute(EVENTS_RESOURCE, OperationClass::External, move || {
                let events = events.clone();
                let envelope = envelope.clone();
                async move {
                    events
                        .publish(envelope)
                        .await
                        .map_err(|e| ApiError::EventPublish(e.into()))
                }
            })
            .await;

        if let Err(err) = result {
            warn!(event_type, error = %err, "event publish failed, continuing");
        }
    }
}
