use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::app::AppState;
use crate::domain::{Cart, CartItem};
use crate::errors::ApiError;
use crate::handlers::common::{validate_input, validate_user_id, AppJson, ID_PATTERN};
use crate::middleware::RequestContext;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/:user_id", get(get_cart).delete(clear_cart))
        .route("/:user_id/items", post(add_item))
        .route(
            "/:user_id/items/:item_id",
            patch(update_item_quantity).delete(remove_item),
        )
        .route("/:user_id/merge", post(merge_guest_cart))
}

async fn get_cart(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
) -> Result<Json<CartResponse>, ApiError> {
    validate_user_id(&user_id)?;
    let cart = state.cart_service.get_cart(&ctx, &user_id).await?;
    Ok(Json(CartResponse::from(cart)))
}

async fn add_item(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
    AppJson(payload): AppJson<AddItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_user_id(&user_id)?;
    validate_input(&payload)?;

    let item = CartItem::new(payload.product_id, payload.quantity, payload.unit_price);
    let cart = state.cart_service.add_item(&ctx, &user_id, item).await?;
    Ok((StatusCode::CREATED, Json(CartResponse::from(cart))))
}

async fn update_item_quantity(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((user_id, item_id)): Path<(String, String)>,
    AppJson(payload): AppJson<UpdateQuantityRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    validate_user_id(&user_id)?;
    validate_input(&payload)?;
    let item_id = parse_item_id(&item_id)?;

    let cart = state
        .cart_service
        .update_item_quantity(
            &ctx,
            &user_id,
            item_id,
            payload.quantity,
            payload.version.unwrap_or(0),
        )
        .await?;
    Ok(Json(CartResponse::from(cart)))
}

async fn remove_item(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path((user_id, item_id)): Path<(String, String)>,
) -> Result<Json<CartResponse>, ApiError> {
    validate_user_id(&user_id)?;
    let item_id = parse_item_id(&item_id)?;

    let cart = state.cart_service.remove_item(&ctx, &user_id, item_id).await?;
    Ok(Json(CartResponse::from(cart)))
}

async fn clear_cart(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    validate_user_id(&user_id)?;
    state.cart_service.clear_cart(&ctx, &user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn merge_guest_cart(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(user_id): Path<String>,
    AppJson(payload): AppJson<MergeCartRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    validate_user_id(&user_id)?;
    validate_input(&payload)?;

    let cart = state
        .cart_service
        .merge_guest_cart(&ctx, &user_id, &payload.guest_id)
        .await?;
    Ok(Json(CartResponse::from(cart)))
}

fn parse_item_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::validation("item id must be a UUID"))
}

// Request DTOs

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AddItemRequest {
    #[validate(length(min = 1, max = 64), regex = "ID_PATTERN")]
    pub product_id: String,
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
    #[validate(range(min = 0, max = 999_999_999))]
    pub unit_price: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct UpdateQuantityRequest {
    #[validate(range(min = 1, max = 99))]
    pub quantity: i32,
    /// Expected cart version; omitted or 0 skips the pre-save check.
    #[validate(range(min = 0))]
    pub version: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct MergeCartRequest {
    #[validate(length(min = 1, max = 64), regex = "ID_PATTERN")]
    pub guest_id: String,
}

// Response DTOs

#[derive(Debug, Serialize)]
pub struct CartItemResponse {
    pub item_id: Uuid,
    pub product_id: String,
    pub quantity: i32,
    pub unit_price: i64,
    pub subtotal: i64,
    pub added_at: DateTime<Utc>,
}

impl From<&CartItem> for CartItemResponse {
    fn from(item: &CartItem) -> Self {
        Self {
            item_id: item.item_id,
            product_id: item.product_id.clone(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            subtotal: item.subtotal(),
            added_at: item.added_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CartResponse {
    pub id: Uuid,
    pub user_id: String,
    pub items: Vec<CartItemResponse>,
    pub item_count: usize,
    pub total_quantity: i64,
    pub total_price: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Cart> for CartResponse {
    fn from(cart: Cart) -> Self {
        Self {
            item_count: cart.item_count(),
            total_quantity: cart.total_quantity(),
            total_price: cart.total_price(),
            items: cart.items.iter().map(CartItemResponse::from).collect(),
            id: cart.id,
            user_id: cart.user_id,
            version: cart.version,
            created_at: cart.created_at,
            updated_at: cart.updated_at,
            expires_at: cart.expires_at,
        }
    }
}
