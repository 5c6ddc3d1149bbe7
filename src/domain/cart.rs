use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ApiError;

/// Hard cap on distinct items in one cart.
pub const MAX_ITEMS_PER_CART: usize = 100;
/// Hard cap on the quantity of a single line.
pub const MAX_ITEM_QUANTITY: i32 = 99;
/// Upper bound on a unit price, in integer minor units.
pub const MAX_UNIT_PRICE: i64 = 999_999_999;
/// Sliding cart lifetime; every mutation pushes expiry out this far.
pub const CART_TTL_DAYS: i64 = 7;

/// One line of a cart. `item_id` is stable across quantity and price
/// updates to the same line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartItem {
    pub item_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    /// Builds a line without validating it; bounds are enforced when the
    /// line is added to a cart.
    pub fn new(product_id: impl Into<String>, quantity: i32, unit_price: i64) -> Self {
        Self {
            item_id: Uuid::new_v4(),
            product_id: product_id.into(),
            quantity,
            unit_price,
            added_at: Utc::now(),
        }
    }

    pub fn subtotal(&self) -> i64 {
        self.unit_price * i64::from(self.quantity)
    }
}

/// Aggregate root: one cart per user. All mutation goes through the
/// methods below so the quantity and item-count invariants hold on every
/// persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub id: Uuid,
    pub user_id: String,
    pub items: Vec<CartItem>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            items: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
            expires_at: now + Duration::days(CART_TTL_DAYS),
        }
    }

    /// Adds a line, folding it into an existing line with the same
    /// `product_id`. On a fold the quantity is summed and the incoming
    /// unit price wins.
    pub fn add_item(&mut self, item: CartItem) -> Result<(), ApiError> {
        validate_quantity(item.quantity)?;

        if let Some(existing) = self
            .items
            .iter_mut()
            .find(|line| line.product_id == item.product_id)
        {
            let merged = i64::from(existing.quantity) + i64::from(item.quantity);
            if merged > i64::from(MAX_ITEM_QUANTITY) {
                return Err(ApiError::QuantityLimitExceeded {
                    requested: merged,
                    max_quantity: MAX_ITEM_QUANTITY,
                });
            }
            existing.quantity = merged as i32;
            existing.unit_price = item.unit_price;
            self.touch();
            return Ok(());
        }

        if self.items.len() >= MAX_ITEMS_PER_CART {
            return Err(ApiError::CartLimitExceeded {
                max_items: MAX_ITEMS_PER_CART,
            });
        }
        self.items.push(item);
        self.touch();
        Ok(())
    }

    /// Removes a line by its id. Ordering of the remaining lines is not
    /// preserved.
    pub fn remove_item(&mut self, item_id: Uuid) -> Result<CartItem, ApiError> {
        let position = self
            .items
            .iter()
            .position(|line| line.item_id == item_id)
            .ok_or_else(|| ApiError::ItemNotFound {
                item_id: item_id.to_string(),
            })?;
        let removed = self.items.swap_remove(position);
        self.touch();
        Ok(removed)
    }

    pub fn update_item_quantity(&mut self, item_id: Uuid, quantity: i32) -> Result<(), ApiError> {
        validate_quantity(quantity)?;
        let line = self
            .items
            .iter_mut()
            .find(|line| line.item_id == item_id)
            .ok_or_else(|| ApiError::ItemNotFound {
                item_id: item_id.to_string(),
            })?;
        line.quantity = quantity;
        self.touch();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.touch();
    }

    pub fn increment_version(&mut self) {
        self.version += 1;
    }

    /// Pushes expiry out so it is never earlier than `updated_at` plus the
    /// cart lifetime.
    pub fn extend_expiration(&mut self) {
        let floor = self.updated_at + Duration::days(CART_TTL_DAYS);
        if floor > self.expires_at {
            self.expires_at = floor;
        }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }

    pub fn find_item(&self, item_id: Uuid) -> Option<&CartItem> {
        self.items.iter().find(|line| line.item_id == item_id)
    }

    pub fn find_by_product(&self, product_id: &str) -> Option<&CartItem> {
        self.items.iter().find(|line| line.product_id == product_id)
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    pub fn total_quantity(&self) -> i64 {
        self.items.iter().map(|line| i64::from(line.quantity)).sum()
    }

    pub fn total_price(&self) -> i64 {
        self.items.iter().map(CartItem::subtotal).sum()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.extend_expiration();
    }

    /// Folds the guest cart's lines into this cart. Matching products keep
    /// the larger of the two quantities rather than the sum; unmatched
    /// lines are appended while room remains. Returns how many guest lines
    /// were dropped for lack of room.
    pub fn merge_guest_items(&mut self, guest: &Cart) -> usize {
        let mut dropped = 0;
        for guest_line in &guest.items {
            if let Some(existing) = self
                .items
                .iter_mut()
                .find(|line| line.product_id == guest_line.product_id)
            {
                existing.quantity = existing.quantity.max(guest_line.quantity);
            } else if self.items.len() < MAX_ITEMS_PER_CART {
                self.items.push(guest_line.clone());
            } else {
                dropped += 1;
            }
        }
        self.touch();
        dropped
    }
}

fn validate_quantity(quantity: i32) -> Result<(), ApiError> {
    if quantity < 1 {
        return Err(ApiError::InvalidQuantity {
            requested: i64::from(quantity),
        });
    }
    if quantity > MAX_ITEM_QUANTITY {
        return Err(ApiError::QuantityLimitExceeded {
            requested: i64::from(quantity),
            max_quantity: MAX_ITEM_QUANTITY,
        });
    }
    Ok(())
}

/// Merges a guest cart into a user cart. Either side may be absent:
/// without a guest the user cart is returned unchanged, without a user
/// cart the guest cart is promoted with a bumped `updated_at`. Returns the
/// merged cart (if any input existed) and the number of dropped guest
/// lines.
pub fn merge_carts(user: Option<Cart>, guest: Option<Cart>) -> (Option<Cart>, usize) {
    match (user, guest) {
        (Some(user), None) => (Some(user), 0),
        (None, Some(mut guest)) => {
            guest.touch();
            (Some(guest), 0)
        }
        (Some(mut user), Some(guest)) => {
            let dropped = user.merge_guest_items(&guest);
            (Some(user), dropped)
        }
        (None, None) => (None, 0),
    }
}
