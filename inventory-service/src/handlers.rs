use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use shared::{
    CheckAvailability, MessageEnvelope, OrderCreated, CHECK_AVAILABILITY, ORDER_CREATED,
    PRODUCT_CHECK_AVAILABILITY,
};
use thiserror::Error;
use tracing::{debug, Span};

use crate::availability::AvailabilityChecker;
use crate::error::StoreError;
use crate::reservation::{ReservationError, ReservationManager};
use crate::store::StockStore;

/// Result of a handler that ran to completion.
#[derive(Debug)]
pub enum Handled {
    Completed { reply: Option<Vec<u8>> },
    /// An expected domain outcome that redelivery cannot change.
    Rejected { reason: String, reply: Option<Vec<u8>> },
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            HandlerError::Transient(err.to_string())
        } else {
            HandlerError::Permanent(err.to_string())
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<Handled, HandlerError>;
}

/// Maps message patterns to their handlers.
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<String, Arc<dyn MessageHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, pattern: &str, handler: impl MessageHandler + 'static) -> Self {
        self.routes.insert(pattern.to_string(), Arc::new(handler));
        self
    }

    pub fn handler(&self, pattern: &str) -> Option<Arc<dyn MessageHandler>> {
        self.routes.get(pattern).cloned()
    }

    pub fn patterns(&self) -> Vec<&str> {
        let mut patterns: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        patterns.sort_unstable();
        patterns
    }
}

/// The routing table of the inventory service.
pub fn inventory_router(store: Arc<dyn StockStore>) -> Router {
    Router::new()
        .route(
            ORDER_CREATED,
            OrderCreatedHandler::new(ReservationManager::new(Arc::clone(&store))),
        )
        .route(
            CHECK_AVAILABILITY,
            CheckAvailabilityHandler::new(AvailabilityChecker::new(Arc::clone(&store))),
        )
        .route(
            PRODUCT_CHECK_AVAILABILITY,
            CheckAvailabilityHandler::new(AvailabilityChecker::new(store)),
        )
}

fn encode<T: Serialize>(reply: &T) -> Result<Vec<u8>, HandlerError> {
    serde_json::to_vec(reply).map_err(|e| HandlerError::Permanent(format!("failed to encode reply: {e}")))
}

pub struct OrderCreatedHandler {
    reservations: ReservationManager,
}

impl OrderCreatedHandler {
    pub fn new(reservations: ReservationManager) -> Self {
        Self { reservations }
    }
}

#[async_trait]
impl MessageHandler for OrderCreatedHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<Handled, HandlerError> {
        let order: OrderCreated = envelope
            .data()
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;
        Span::current().record("order_id", order.order_id.as_str());
        Span::current().record("sku", order.sku.as_str());
        debug!(quantity = order.quantity, "Received order created event");

        let outcome = self
            .reservations
            .reserve(&order.order_id, &order.sku, order.quantity)
            .await
            .map_err(|e| match e {
                ReservationError::InvalidQuantity(_) => HandlerError::Malformed(e.to_string()),
                ReservationError::Store(store) => HandlerError::from(store),
            })?;

        let reply = Some(encode(&outcome.reply(&order.order_id))?);
        if outcome.is_success() {
            Ok(Handled::Completed { reply })
        } else {
            Ok(Handled::Rejected {
                reason: outcome.to_string(),
                reply,
            })
        }
    }
}

pub struct CheckAvailabilityHandler {
    checker: AvailabilityChecker,
}

impl CheckAvailabilityHandler {
    pub fn new(checker: AvailabilityChecker) -> Self {
        Self { checker }
    }
}

#[async_trait]
impl MessageHandler for CheckAvailabilityHandler {
    async fn handle(&self, envelope: &MessageEnvelope) -> Result<Handled, HandlerError> {
        let query: CheckAvailability = envelope
            .data()
            .map_err(|e| HandlerError::Malformed(e.to_string()))?;
        Span::current().record("sku", query.sku.as_str());
        debug!(quantity = query.quantity, "Received inventory check request");

        let reply = self.checker.check(&query.sku, query.quantity).await?;
        let payload = Some(encode(&reply)?);
        if reply.sku_exists {
            Ok(Handled::Completed { reply: payload })
        } else {
            Ok(Handled::Rejected {
                reason: format!("SKU {} not found", query.sku),
                reply: payload,
            })
        }
    }
}
