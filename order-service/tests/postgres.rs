//! PostgreSQL integration tests for the ledger, the order store and checkout.
//!
//! Run with: DATABASE_URL=postgres://... cargo test -p order-service --test postgres -- --ignored
//!
//! Requires: DATABASE_URL pointing at a disposable database. Migrations are applied on first use.

use bigdecimal::BigDecimal;
use diesel::{Connection, ExpressionMethods, PgConnection};
use diesel_async::{
    pooled_connection::{bb8::Pool, AsyncDieselConnectionManager},
    AsyncPgConnection, RunQueryDsl,
};
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use inventory_service::{InventoryLedger, LedgerError, PgInventoryLedger, ReservationKey, StockUpdate};
use order_service::{
    catalog::PgCatalog,
    schema::{product_variants, products},
    store::{OrderStore, PgOrderStore, StatusChange},
    OrderService, ReservationPolicy,
};
use shared::*;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");
const TIMEOUT: Duration = Duration::from_secs(5);

type DbPool = Pool<AsyncPgConnection>;

static MIGRATED: OnceLock<()> = OnceLock::new();

fn database_url() -> String {
    std::env::var("DATABASE_URL").expect("DATABASE_URL must point at a disposable PostgreSQL database")
}

async fn pool() -> DbPool {
    let url = database_url();
    MIGRATED.get_or_init(|| {
        let mut conn = PgConnection::establish(&url).expect("connect for migrations");
        conn.run_pending_migrations(MIGRATIONS).expect("run migrations");
    });
    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(&url);
    Pool::builder().max_size(4).build(config).await.expect("build pool")
}

async fn seed_variant(pool: &DbPool, price: &str) -> Uuid {
    let mut conn = pool.get().await.unwrap();
    let product_id = Uuid::new_v4();
    let variant_id = Uuid::new_v4();

    diesel::insert_into(products::table)
        .values((products::id.eq(product_id), products::name.eq("Walnut desk")))
        .execute(&mut conn)
        .await
        .unwrap();
    diesel::insert_into(product_variants::table)
        .values((
            product_variants::id.eq(variant_id),
            product_variants::product_id.eq(product_id),
            product_variants::sku.eq(format!("DESK-{}", variant_id)),
            product_variants::price.eq(BigDecimal::from_str(price).unwrap()),
            product_variants::attributes.eq(serde_json::json!({ "finish": "oiled" })),
        ))
        .execute(&mut conn)
        .await
        .unwrap();
    variant_id
}

fn stock(quantity: i32) -> StockUpdate {
    StockUpdate {
        quantity: Some(quantity),
        low_stock_threshold: None,
    }
}

fn line(variant_id: Uuid, price: &str, quantity: i32) -> LineItem {
    LineItem {
        variant_id,
        product_name: "Walnut desk".to_string(),
        unit_price: BigDecimal::from_str(price).unwrap(),
        quantity,
        variant_attributes: Attributes::new(),
    }
}

#[tokio::test]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn line_reservations_are_claimed_once() {
    let pool = pool().await;
    let ledger = PgInventoryLedger::new(pool.clone(), TIMEOUT);
    let variant_id = seed_variant(&pool, "120").await;
    ledger.update_stock(variant_id, stock(5)).await.unwrap();

    let order_id = Uuid::new_v4();
    let key = ReservationKey::new(order_id, 0);
    let first = ledger.reserve_line(key, variant_id, 3).await.unwrap();
    let again = ledger.reserve_line(key, variant_id, 3).await.unwrap();
    assert_eq!(first.id, again.id);
    assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 3);

    let err = ledger
        .reserve_line(ReservationKey::new(order_id, 1), variant_id, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Insufficient { available: 2, requested: 3, .. }));

    let released = ledger.release_order(order_id).await.unwrap();
    assert_eq!(released.len(), 1);
    assert!(ledger.release_order(order_id).await.unwrap().is_empty());
    assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 0);

    assert!(matches!(
        ledger.reserve_line(key, variant_id, 3).await,
        Err(LedgerError::ReservationClosed { .. })
    ));
}

#[tokio::test]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn stock_updates_are_all_or_nothing() {
    let pool = pool().await;
    let ledger = PgInventoryLedger::new(pool.clone(), TIMEOUT);
    let variant_id = seed_variant(&pool, "15").await;
    ledger.update_stock(variant_id, stock(5)).await.unwrap();

    let rejected = StockUpdate {
        quantity: Some(12),
        low_stock_threshold: Some(-1),
    };
    assert!(matches!(
        ledger.update_stock(variant_id, rejected).await,
        Err(LedgerError::InvalidAmount(-1))
    ));
    let record = ledger.get(variant_id).await.unwrap().unwrap();
    assert_eq!(record.quantity, 5);

    let both = StockUpdate {
        quantity: Some(12),
        low_stock_threshold: Some(2),
    };
    let record = ledger.update_stock(variant_id, both).await.unwrap();
    assert_eq!((record.quantity, record.low_stock_threshold), (12, 2));

    let unknown = Uuid::new_v4();
    assert!(matches!(
        ledger.update_stock(unknown, stock(1)).await,
        Err(LedgerError::UnknownVariant(id)) if id == unknown
    ));
}

#[tokio::test]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn stored_orders_round_trip_and_settle_once() {
    let pool = pool().await;
    let store = PgOrderStore::new(pool.clone(), TIMEOUT);
    let desk = seed_variant(&pool, "120").await;
    let lamp = seed_variant(&pool, "15.5").await;
    let user_id = Uuid::new_v4();

    let draft = OrderDraft::new(
        user_id,
        Uuid::new_v4(),
        vec![line(lamp, "15.5", 2), line(desk, "120", 1)],
        BigDecimal::from_str("4.5").unwrap(),
        BigDecimal::from(0),
    );
    let order = draft.into_order(store.next_order_number().await.unwrap());

    let stored = store.insert(order.clone()).await.unwrap();
    let repeated = store.insert(order.clone()).await.unwrap();
    assert_eq!(stored.id, repeated.id);
    assert_eq!(stored.shipping_cost.to_string(), "4.50");
    assert_eq!(stored.total.to_string(), "155.50");
    assert_eq!(
        stored.items.iter().map(|i| i.variant_id).collect::<Vec<_>>(),
        vec![lamp, desk]
    );
    assert!(stored.reserving);
    assert!(store.list(Some(user_id)).await.unwrap().is_empty());

    let cancel = StatusChange {
        status: OrderStatus::Cancelled,
        cancel_reason: Some(CancelReason::Requested),
        notes: None,
    };
    assert!(store
        .update_status(order.id, OrderStatus::Pending, cancel.clone())
        .await
        .unwrap()
        .is_none());

    let settled = store.settle_reservation(order.id, None).await.unwrap().unwrap();
    assert!(!settled.reserving);
    assert!(store.settle_reservation(order.id, None).await.unwrap().is_none());
    assert_eq!(store.list(Some(user_id)).await.unwrap().len(), 1);

    let cancelled = store
        .update_status(order.id, OrderStatus::Pending, cancel.clone())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(store
        .update_status(order.id, OrderStatus::Pending, cancel)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore = "requires PostgreSQL via DATABASE_URL"]
async fn checkout_reserves_and_cancellation_releases() {
    let pool = pool().await;
    let ledger = Arc::new(PgInventoryLedger::new(pool.clone(), TIMEOUT));
    let service = OrderService::new(
        Arc::new(PgCatalog::new(pool.clone(), TIMEOUT)),
        ledger.clone(),
        Arc::new(PgOrderStore::new(pool.clone(), TIMEOUT)),
        ReservationPolicy::default(),
    );
    let variant_id = seed_variant(&pool, "9.99").await;
    ledger.update_stock(variant_id, stock(4)).await.unwrap();
    let user_id = Uuid::new_v4();

    let place = |quantity: i32, shipping: &str| PlaceOrder {
        address_id: Some(Uuid::new_v4()),
        items: vec![ItemRequest { variant_id, quantity }],
        shipping_cost: Some(BigDecimal::from_str(shipping).unwrap()),
        tax: None,
    };

    let order = service.create_order(user_id, place(3, "1.5")).await.unwrap();
    assert_eq!(order.shipping_cost.to_string(), "1.50");
    assert_eq!(order.total.to_string(), "31.47");
    assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 3);
    assert_eq!(ledger.reservations(order.id).await.unwrap().len(), 1);

    assert!(matches!(
        service.create_order(user_id, place(1, "0.005")).await,
        Err(OrderError::Validation(_))
    ));
    assert!(matches!(
        service.create_order(user_id, place(2, "0")).await,
        Err(OrderError::InsufficientStock { available: 1, requested: 2, .. })
    ));

    service
        .set_order_status(order.id, OrderStatus::Cancelled, None)
        .await
        .unwrap();
    assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 0);

    let mine = service.get_orders(&Principal::new(user_id)).await.unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].status, OrderStatus::Cancelled);
}
