//! Reservation atomicity against a real PostgreSQL instance.
//!
//! Each test starts its own PostgreSQL container and runs the embedded
//! migrations. The tests are marked `#[ignore]` because they need Docker.
//!
//! To run explicitly:
//! ```bash
//! cargo test -p inventory-service --test postgres -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use diesel::{Connection, PgConnection};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use inventory_service::availability::AvailabilityChecker;
use inventory_service::error::StoreError;
use inventory_service::models::{NewProduct, NewReservation};
use inventory_service::reservation::{ReservationManager, ReservationOutcome};
use inventory_service::store::{PgStockStore, StockStore};
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Keeps the container alive for as long as the store is used.
struct TestDb {
    #[allow(dead_code)]
    container: ContainerAsync<Postgres>,
    store: Arc<PgStockStore>,
}

async fn start_db() -> TestDb {
    let container = Postgres::default()
        .start()
        .await
        .expect("Failed to start Postgres container");
    let host = container.get_host().await.expect("Failed to get host");
    let port = container
        .get_host_port_ipv4(5432)
        .await
        .expect("Failed to get port");
    let database_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

    let migration_url = database_url.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = PgConnection::establish(&migration_url).expect("Failed to connect");
        conn.run_pending_migrations(MIGRATIONS)
            .expect("Failed to run migrations");
    })
    .await
    .unwrap();

    let config = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(16)
        .build(config)
        .await
        .expect("Failed to build pool");

    TestDb {
        container,
        store: Arc::new(PgStockStore::new(pool)),
    }
}

async fn create_product(store: &PgStockStore, sku: &str, stock: i32) {
    store
        .create_product(NewProduct {
            id: Uuid::new_v4(),
            sku: sku.to_string(),
            name: format!("Product {sku}"),
            description: None,
            price: BigDecimal::from(10),
            stock_quantity: stock,
        })
        .await
        .unwrap();
}

fn manager(db: &TestDb) -> ReservationManager {
    ReservationManager::new(db.store.clone())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn concurrent_orders_never_oversell() {
    let db = start_db().await;
    create_product(&db.store, "SKU-1", 10).await;
    let reservations = manager(&db);

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let reservations = reservations.clone();
            tokio::spawn(async move { reservations.reserve(&format!("order-{i}"), "SKU-1", 1).await })
        })
        .collect();

    let mut reserved = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            ReservationOutcome::Reserved { .. } => reserved += 1,
            ReservationOutcome::InsufficientStock { .. } => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    assert_eq!(reserved, 10);
    let availability = AvailabilityChecker::new(db.store.clone())
        .availability("SKU-1")
        .await
        .unwrap();
    assert_eq!(availability.available_quantity, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore]
async fn racing_redeliveries_reserve_once() {
    let db = start_db().await;
    create_product(&db.store, "SKU-1", 10).await;
    let reservations = manager(&db);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let reservations = reservations.clone();
            tokio::spawn(async move { reservations.reserve("order-1", "SKU-1", 3).await })
        })
        .collect();

    let mut reserved = 0;
    for task in tasks {
        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.is_success(), "unexpected outcome {outcome:?}");
        if let ReservationOutcome::Reserved { .. } = outcome {
            reserved += 1;
        }
    }

    assert_eq!(reserved, 1);
    let availability = AvailabilityChecker::new(db.store.clone())
        .availability("SKU-1")
        .await
        .unwrap();
    assert_eq!(availability.available_quantity, 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn sku_lock_blocks_a_second_transaction_until_commit() {
    let db = start_db().await;
    create_product(&db.store, "SKU-1", 10).await;

    let mut holder = db.store.begin().await.unwrap();
    assert!(holder.lock_product("SKU-1").await.unwrap().is_some());

    let store = db.store.clone();
    let mut waiter = tokio::spawn(async move {
        let mut tx = store.begin().await.unwrap();
        let product = tx.lock_product("SKU-1").await.unwrap();
        tx.commit().await.unwrap();
        product.is_some()
    });

    assert!(tokio::time::timeout(Duration::from_millis(300), &mut waiter)
        .await
        .is_err());

    holder.commit().await.unwrap();
    assert!(waiter.await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore]
async fn order_id_raced_in_on_another_sku_is_already_reserved() {
    let db = start_db().await;
    create_product(&db.store, "SKU-A", 10).await;
    create_product(&db.store, "SKU-B", 10).await;

    // The first transaction holds an uncommitted reservation for order-1, so
    // the second one cannot see it and only trips over the unique index.
    let mut first = db.store.begin().await.unwrap();
    first.lock_product("SKU-A").await.unwrap();
    first
        .insert_reservation(NewReservation::reserved("order-1", "SKU-A", 2))
        .await
        .unwrap();

    let reservations = manager(&db);
    let mut second =
        tokio::spawn(async move { reservations.reserve("order-1", "SKU-B", 2).await });
    assert!(tokio::time::timeout(Duration::from_millis(300), &mut second)
        .await
        .is_err());

    first.commit().await.unwrap();
    let outcome = second.await.unwrap().unwrap();

    assert_eq!(outcome, ReservationOutcome::AlreadyReserved);
    let checker = AvailabilityChecker::new(db.store.clone());
    assert_eq!(checker.availability("SKU-A").await.unwrap().available_quantity, 8);
    assert_eq!(checker.availability("SKU-B").await.unwrap().available_quantity, 10);
}

#[tokio::test]
#[ignore]
async fn duplicate_insert_is_classified_and_rollback_discards() {
    let db = start_db().await;
    create_product(&db.store, "SKU-1", 10).await;

    let mut tx = db.store.begin().await.unwrap();
    tx.insert_reservation(NewReservation::reserved("order-1", "SKU-1", 4))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = db.store.begin().await.unwrap();
    let err = tx
        .insert_reservation(NewReservation::reserved("order-1", "SKU-1", 4))
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Duplicate(_)), "got {err:?}");
    tx.rollback().await.unwrap();

    let mut tx = db.store.begin().await.unwrap();
    tx.insert_reservation(NewReservation::reserved("order-2", "SKU-1", 5))
        .await
        .unwrap();
    assert_eq!(tx.sum_active_reservations("SKU-1").await.unwrap(), 9);
    tx.rollback().await.unwrap();

    let mut tx = db.store.begin().await.unwrap();
    assert_eq!(tx.sum_active_reservations("SKU-1").await.unwrap(), 4);
    assert!(tx.find_reservation("order-2").await.unwrap().is_none());
    tx.rollback().await.unwrap();
}
