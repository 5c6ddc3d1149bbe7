//! Service-level tests for the cart orchestration: lifecycle, the
//! versioned persistence protocol, merge semantics, and event emission.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration as ChronoDuration, Utc};
use common::{test_context, ServiceHarness};
use uuid::Uuid;

use cart_api::domain::{Cart, CartItem};
use cart_api::errors::ApiError;
use cart_api::repository::CartRepository as _;

#[tokio::test]
async fn get_cart_for_unknown_user_is_not_found() {
    let harness = ServiceHarness::new();
    let err = harness
        .service
        .get_cart(&test_context(), "u1")
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::CartNotFound { .. });
}

#[tokio::test]
async fn get_or_create_creates_once_then_reuses() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let (created, was_created) = harness
        .service
        .get_or_create_cart(&ctx, "u1")
        .await
        .expect("create");
    assert!(was_created);
    assert_eq!(created.version, 1);

    let (loaded, was_created) = harness
        .service
        .get_or_create_cart(&ctx, "u1")
        .await
        .expect("load");
    assert!(!was_created);
    assert_eq!(loaded.id, created.id);

    assert_eq!(harness.publisher.event_types(), vec!["cart.created"]);
}

#[tokio::test]
async fn add_item_creates_cart_and_publishes() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("add");

    assert_eq!(cart.version, 2, "fresh cart at v1, one mutation");
    assert_eq!(cart.total_price(), 1000);

    let types = harness.publisher.event_types();
    assert_eq!(types, vec!["cart.created", "cart.item_added"]);

    let added = &harness.publisher.events()[1];
    assert_eq!(added.data["cart_total"], 1000);
    assert_eq!(added.data["item_count"], 1);
    assert_eq!(added.metadata.user_id, "u1");
    assert_eq!(added.metadata.trace_id.as_deref(), Some("Root=1-test"));
}

#[tokio::test]
async fn add_same_product_folds_and_bumps_version() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("first add");
    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 3, 600))
        .await
        .expect("second add");

    assert_eq!(cart.item_count(), 1);
    assert_eq!(cart.items[0].quantity, 5);
    assert_eq!(cart.items[0].unit_price, 600);
    assert_eq!(cart.version, 3);
}

#[tokio::test]
async fn versions_increase_by_one_per_mutation() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let v1 = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 1, 100))
        .await
        .expect("add")
        .version;
    let v2 = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p2", 1, 100))
        .await
        .expect("add")
        .version;
    let cart = harness
        .service
        .clear_cart(&ctx, "u1")
        .await
        .expect("clear")
        .expect("cart existed");

    assert_eq!(v2, v1 + 1);
    assert_eq!(cart.version, v2 + 1);
    assert!(cart.items.is_empty());
}

#[tokio::test]
async fn update_quantity_with_matching_version_succeeds() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("add");
    let item_id = cart.items[0].item_id;

    let updated = harness
        .service
        .update_item_quantity(&ctx, "u1", item_id, 4, cart.version)
        .await
        .expect("update");

    assert_eq!(updated.items[0].quantity, 4);
    assert_eq!(updated.version, cart.version + 1);
    assert!(harness
        .publisher
        .event_types()
        .contains(&"cart.item_updated".to_string()));
}

#[tokio::test]
async fn update_quantity_with_stale_version_conflicts() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("add");
    let item_id = cart.items[0].item_id;
    let stale = cart.version - 1;

    let err = harness
        .service
        .update_item_quantity(&ctx, "u1", item_id, 4, stale)
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ApiError::Conflict {
            expected_version,
            current_version,
        } if expected_version == stale && current_version == cart.version
    );

    let unchanged = harness.service.get_cart(&ctx, "u1").await.expect("get");
    assert_eq!(unchanged.items[0].quantity, 2, "conflict must not mutate");
}

#[tokio::test]
async fn update_quantity_version_zero_skips_the_check() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("add");

    let updated = harness
        .service
        .update_item_quantity(&ctx, "u1", cart.items[0].item_id, 9, 0)
        .await
        .expect("update without version check");
    assert_eq!(updated.items[0].quantity, 9);
}

#[tokio::test]
async fn update_quantity_unknown_item_is_not_found() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("add");

    let err = harness
        .service
        .update_item_quantity(&ctx, "u1", Uuid::new_v4(), 4, 0)
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::ItemNotFound { .. });
}

#[tokio::test]
async fn remove_item_twice_fails_second_time() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 500))
        .await
        .expect("add");
    let item_id = cart.items[0].item_id;

    let cleared = harness
        .service
        .remove_item(&ctx, "u1", item_id)
        .await
        .expect("remove");
    assert!(cleared.items.is_empty());

    let err = harness
        .service
        .remove_item(&ctx, "u1", item_id)
        .await
        .unwrap_err();
    assert_matches!(err, ApiError::ItemNotFound { .. });
}

#[tokio::test]
async fn clear_cart_missing_user_is_a_silent_noop() {
    let harness = ServiceHarness::new();
    let cleared = harness
        .service
        .clear_cart(&test_context(), "nobody")
        .await
        .expect("no-op");
    assert!(cleared.is_none());
    assert!(harness.publisher.events().is_empty());
}

#[tokio::test]
async fn delete_cart_is_idempotent() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 1, 100))
        .await
        .expect("seed");

    harness.service.delete_cart("u1").await.expect("delete");
    harness
        .service
        .delete_cart("u1")
        .await
        .expect("second delete succeeds");

    let err = harness.service.get_cart(&ctx, "u1").await.unwrap_err();
    assert_matches!(err, ApiError::CartNotFound { .. });
}

#[tokio::test]
async fn merge_uses_max_quantity_and_deletes_guest() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 100))
        .await
        .expect("user p1");
    harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p2", 1, 100))
        .await
        .expect("user p2");
    harness
        .service
        .add_item(&ctx, "g1", CartItem::new("p1", 5, 100))
        .await
        .expect("guest p1");

    let merged = harness
        .service
        .merge_guest_cart(&ctx, "u1", "g1")
        .await
        .expect("merge");

    assert_eq!(merged.item_count(), 2);
    assert_eq!(merged.find_by_product("p1").expect("p1").quantity, 5);
    assert_eq!(merged.find_by_product("p2").expect("p2").quantity, 1);

    let err = harness.service.get_cart(&ctx, "g1").await.unwrap_err();
    assert_matches!(err, ApiError::CartNotFound { .. }, "guest cart deleted");
}

#[tokio::test]
async fn merge_with_absent_guest_returns_user_cart_unchanged() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let cart = harness
        .service
        .add_item(&ctx, "u1", CartItem::new("p1", 2, 100))
        .await
        .expect("seed");

    let merged = harness
        .service
        .merge_guest_cart(&ctx, "u1", "ghost")
        .await
        .expect("merge");
    assert_eq!(merged.version, cart.version, "no mutation persisted");
    assert_eq!(merged.items, cart.items);
}

#[tokio::test]
async fn expired_cart_reads_as_expired_and_emits_abandoned() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let mut cart = Cart::new("u1");
    cart.add_item(CartItem::new("p1", 1, 100)).expect("seed");
    cart.expires_at = Utc::now() - ChronoDuration::hours(1);
    harness.repository.save_cart(&cart).await.expect("save expired");

    let err = harness.service.get_cart(&ctx, "u1").await.unwrap_err();
    assert_matches!(err, ApiError::CartExpired { .. });
    assert!(harness
        .publisher
        .event_types()
        .contains(&"cart.abandoned".to_string()));
}

#[tokio::test]
async fn get_or_create_replaces_an_expired_cart() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let mut stale = Cart::new("u1");
    stale.add_item(CartItem::new("p1", 1, 100)).expect("seed");
    stale.expires_at = Utc::now() - ChronoDuration::hours(1);
    harness.repository.save_cart(&stale).await.expect("save expired");

    let (fresh, created) = harness
        .service
        .get_or_create_cart(&ctx, "u1")
        .await
        .expect("recreate");
    assert!(created);
    assert_ne!(fresh.id, stale.id);
    assert!(fresh.items.is_empty());
    assert_eq!(fresh.version, 1);
}

#[tokio::test]
async fn touch_cart_extends_expiration() {
    let harness = ServiceHarness::new();
    let ctx = test_context();

    let mut cart = Cart::new("u1");
    cart.expires_at = Utc::now() + ChronoDuration::hours(1);
    harness.repository.save_cart(&cart).await.expect("seed");

    let touched = harness
        .service
        .touch_cart(&ctx, "u1")
        .await
        .expect("touch");
    assert!(touched.expires_at > Utc::now() + ChronoDuration::days(6));
}
