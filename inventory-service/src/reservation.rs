use std::fmt;
use std::sync::Arc;

use shared::{ReservationReply, ReservationReplyStatus};
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::availability::availability_of;
use crate::error::StoreError;
use crate::models::NewReservation;
use crate::store::{StockStore, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Reserved { remaining: i64 },
    /// A reservation for this order id already exists; nothing was written.
    AlreadyReserved,
    InsufficientStock { requested: i32, available: i64 },
    SkuNotFound,
}

impl ReservationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Reserved { .. } | Self::AlreadyReserved)
    }

    pub fn reply(&self, order_id: &str) -> ReservationReply {
        let (status, available_quantity) = match *self {
            Self::Reserved { remaining } => (ReservationReplyStatus::Reserved, Some(remaining)),
            Self::AlreadyReserved => (ReservationReplyStatus::AlreadyReserved, None),
            Self::InsufficientStock { available, .. } => {
                (ReservationReplyStatus::InsufficientStock, Some(available))
            }
            Self::SkuNotFound => (ReservationReplyStatus::SkuNotFound, None),
        };
        ReservationReply {
            order_id: order_id.to_string(),
            status,
            available_quantity,
        }
    }
}

impl fmt::Display for ReservationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reserved { remaining } => write!(f, "reserved, {remaining} remaining"),
            Self::AlreadyReserved => f.write_str("already reserved"),
            Self::InsufficientStock {
                requested,
                available,
            } => write!(
                f,
                "insufficient stock: requested {requested}, available {available}"
            ),
            Self::SkuNotFound => f.write_str("SKU not found"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReservationError {
    #[error("quantity must be positive, got {0}")]
    InvalidQuantity(i32),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates reservations with a single check-and-insert transaction per call.
#[derive(Clone)]
pub struct ReservationManager {
    store: Arc<dyn StockStore>,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        order_id: &str,
        sku: &str,
        quantity: i32,
    ) -> Result<ReservationOutcome, ReservationError> {
        if quantity <= 0 {
            return Err(ReservationError::InvalidQuantity(quantity));
        }

        let mut tx = self.store.begin().await?;
        let result = Self::check_and_insert(&mut tx, order_id, sku, quantity).await;

        let outcome = match result {
            Ok(outcome @ ReservationOutcome::Reserved { .. }) => {
                tx.commit().await?;
                info!("Reserved {} units of {} for order {}", quantity, sku, order_id);
                outcome
            }
            Ok(outcome) => {
                tx.rollback().await?;
                outcome
            }
            // Another transaction inserted this order id between our lookup
            // and our insert.
            Err(StoreError::Duplicate(_)) => {
                tx.rollback().await?;
                ReservationOutcome::AlreadyReserved
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback after failed reservation also failed");
                }
                return Err(e.into());
            }
        };

        match outcome {
            ReservationOutcome::AlreadyReserved => {
                info!("Order {} already has a reservation, skipping", order_id)
            }
            ReservationOutcome::InsufficientStock { available, .. } => warn!(
                available,
                "Insufficient stock for SKU {}. Requested: {}, Available: {}", sku, quantity, available
            ),
            ReservationOutcome::SkuNotFound => warn!("SKU {} not found", sku),
            ReservationOutcome::Reserved { .. } => {}
        }
        Ok(outcome)
    }

    async fn check_and_insert(
        tx: &mut Transaction<'_>,
        order_id: &str,
        sku: &str,
        quantity: i32,
    ) -> Result<ReservationOutcome, StoreError> {
        let Some(product) = tx.lock_product(sku).await? else {
            return Ok(ReservationOutcome::SkuNotFound);
        };

        if tx.find_reservation(order_id).await?.is_some() {
            return Ok(ReservationOutcome::AlreadyReserved);
        }

        let availability = availability_of(tx, &product).await?;
        if !availability.covers(quantity) {
            return Ok(ReservationOutcome::InsufficientStock {
                requested: quantity,
                available: availability.available_quantity,
            });
        }

        tx.insert_reservation(NewReservation::reserved(order_id, sku, quantity))
            .await?;

        Ok(ReservationOutcome::Reserved {
            remaining: availability.available_quantity - i64::from(quantity),
        })
    }
}
