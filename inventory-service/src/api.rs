use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use shared::AvailabilityReply;
use tokio::sync::watch;
use uuid::Uuid;

use crate::availability::AvailabilityChecker;
use crate::error::{ProductError, StoreError};
use crate::models::{NewProduct, Product, ProductChanges, ProductDraft};
use crate::store::StockStore;
use crate::supervisor::BrokerStatus;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StockStore>,
    pub availability: AvailabilityChecker,
    pub broker_status: watch::Receiver<BrokerStatus>,
}

impl AppState {
    pub fn new(store: Arc<dyn StockStore>, broker_status: watch::Receiver<BrokerStatus>) -> Self {
        Self {
            availability: AvailabilityChecker::new(Arc::clone(&store)),
            store,
            broker_status,
        }
    }
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => ApiError::Unavailable(err.to_string()),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<ProductError> for ApiError {
    fn from(err: ProductError) -> Self {
        match err {
            ProductError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ProductError::DuplicateSku(_) | ProductError::Invalid(_) => {
                ApiError::BadRequest(err.to_string())
            }
            ProductError::Store(store) => store.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker: BrokerStatus,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub quantity: Option<i32>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/products", get(list_products).post(create_product))
        .route(
            "/products/:id",
            get(get_product).put(update_product).delete(delete_product),
        )
        .route("/inventory/:sku/availability", get(check_availability))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker = *state.broker_status.borrow();
    let status = match broker {
        BrokerStatus::Degraded => "degraded",
        BrokerStatus::Connecting | BrokerStatus::Connected => "ok",
    };
    Json(HealthResponse { status, broker })
}

pub async fn list_products(State(state): State<AppState>) -> Result<Json<Vec<Product>>, ApiError> {
    Ok(Json(state.store.list_products().await?))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Product>, ApiError> {
    state
        .store
        .get_product(id)
        .await?
        .map(Json)
        .ok_or_else(|| ProductError::NotFound(id).into())
}

pub async fn create_product(
    State(state): State<AppState>,
    Json(draft): Json<ProductDraft>,
) -> Result<(StatusCode, Json<Product>), ApiError> {
    let product = NewProduct::try_from(draft)?;
    let created = state.store.create_product(product).await?;
    tracing::info!(sku = %created.sku, id = %created.id, "Created product");
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(changes): Json<ProductChanges>,
) -> Result<Json<Product>, ApiError> {
    changes.validate()?;
    state
        .store
        .update_product(id, changes)
        .await?
        .map(Json)
        .ok_or_else(|| ProductError::NotFound(id).into())
}

pub async fn delete_product(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Product>, ApiError> {
    state
        .store
        .delete_product(id)
        .await?
        .map(Json)
        .ok_or_else(|| ProductError::NotFound(id).into())
}

pub async fn check_availability(
    State(state): State<AppState>,
    Path(sku): Path<String>,
    Query(query): Query<AvailabilityQuery>,
) -> Result<Json<AvailabilityReply>, ApiError> {
    let quantity = query.quantity.unwrap_or(1);
    if quantity <= 0 {
        return Err(ApiError::BadRequest(format!(
            "quantity must be positive, got {quantity}"
        )));
    }
    Ok(Json(state.availability.check(&sku, quantity).await?))
}
