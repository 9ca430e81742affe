//! HTTP surface tests against the in-memory store.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use inventory_service::api::{create_router, AppState};
use inventory_service::reservation::ReservationManager;
use inventory_service::store::InMemoryStockStore;
use inventory_service::supervisor::BrokerStatus;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower::ServiceExt;

fn setup() -> (axum::Router, InMemoryStockStore, watch::Sender<BrokerStatus>) {
    let store = InMemoryStockStore::new();
    let (status_tx, status_rx) = watch::channel(BrokerStatus::Connected);
    let app = create_router(AppState::new(Arc::new(store.clone()), status_rx));
    (app, store, status_tx)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn with_json(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn create_widget(app: &axum::Router, sku: &str, stock: i32) -> Value {
    let (status, product) = send(
        app,
        with_json(
            "POST",
            "/products",
            json!({
                "sku": sku,
                "name": "Widget",
                "description": "A very ordinary widget",
                "price": "19.99",
                "stockQuantity": stock
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    product
}

#[tokio::test]
async fn test_health_reports_broker_status() {
    let (app, _, status_tx) = setup();

    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["broker"], "connected");

    status_tx.send_replace(BrokerStatus::Degraded);
    let (status, json) = send(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["broker"], "degraded");
}

#[tokio::test]
async fn test_product_crud() {
    let (app, _, _status_tx) = setup();

    let created = create_widget(&app, "SKU-001", 10).await;
    assert_eq!(created["sku"], "SKU-001");
    assert_eq!(created["stockQuantity"], 10);
    let id = created["id"].as_str().unwrap().to_string();

    let (status, listed) = send(&app, get("/products")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, updated) = send(
        &app,
        with_json(
            "PUT",
            &format!("/products/{id}"),
            json!({ "stockQuantity": 25, "sku": "IGNORED" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(updated["stockQuantity"], 25);
    assert_eq!(updated["sku"], "SKU-001");

    let (status, fetched) = send(&app, get(&format!("/products/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["stockQuantity"], 25);

    let delete = Request::builder()
        .method("DELETE")
        .uri(format!("/products/{id}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::OK);

    let (status, json) = send(&app, get(&format!("/products/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains(&id));
}

#[tokio::test]
async fn test_duplicate_sku_is_rejected() {
    let (app, _, _status_tx) = setup();
    create_widget(&app, "SKU-001", 10).await;

    let (status, json) = send(
        &app,
        with_json(
            "POST",
            "/products",
            json!({ "sku": "SKU-001", "name": "Other", "price": "1.00", "stockQuantity": 1 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn test_negative_stock_is_rejected() {
    let (app, _, _status_tx) = setup();

    let (status, _) = send(
        &app,
        with_json(
            "POST",
            "/products",
            json!({ "sku": "SKU-002", "name": "Widget", "price": "1.00", "stockQuantity": -1 }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_product_is_not_found() {
    let (app, _, _status_tx) = setup();

    let (status, _) = send(
        &app,
        get("/products/00000000-0000-0000-0000-000000000000"),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_availability_accounts_for_reservations() {
    let (app, store, _status_tx) = setup();
    create_widget(&app, "SKU-001", 10).await;
    ReservationManager::new(Arc::new(store.clone()))
        .reserve("order-1", "SKU-001", 7)
        .await
        .unwrap();

    let (status, json) = send(&app, get("/inventory/SKU-001/availability?quantity=3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        json,
        json!({ "skuExists": true, "hasAvailableStock": true, "availableQuantity": 3 })
    );

    let (_, json) = send(&app, get("/inventory/SKU-001/availability?quantity=4")).await;
    assert_eq!(json["hasAvailableStock"], false);

    let (_, json) = send(&app, get("/inventory/SKU-404/availability")).await;
    assert_eq!(
        json,
        json!({ "skuExists": false, "hasAvailableStock": false, "availableQuantity": 0 })
    );

    let (status, _) = send(&app, get("/inventory/SKU-001/availability?quantity=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_store_outage_is_service_unavailable() {
    let (app, store, _status_tx) = setup();
    store.set_unavailable(true);

    let (status, json) = send(&app, get("/products")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].is_string());
}
