use std::sync::Arc;

use shared::AvailabilityReply;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::models::Product;
use crate::store::{StockStore, Transaction};

/// Units still free to reserve. Never negative: a stock level lowered below
/// what is already reserved reports zero.
pub fn available(stock_quantity: i32, reserved: i64) -> i64 {
    (i64::from(stock_quantity) - reserved).max(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Availability {
    pub sku_exists: bool,
    pub available_quantity: i64,
}

impl Availability {
    pub const fn missing() -> Self {
        Self {
            sku_exists: false,
            available_quantity: 0,
        }
    }

    pub fn covers(&self, quantity: i32) -> bool {
        self.sku_exists && self.available_quantity >= i64::from(quantity)
    }

    pub fn reply(&self, quantity: i32) -> AvailabilityReply {
        AvailabilityReply {
            sku_exists: self.sku_exists,
            has_available_stock: self.covers(quantity),
            available_quantity: self.available_quantity,
        }
    }
}

/// Availability of an already-loaded product, read inside the caller's
/// transaction.
pub async fn availability_of(
    tx: &mut Transaction<'_>,
    product: &Product,
) -> Result<Availability, StoreError> {
    let reserved = tx.sum_active_reservations(&product.sku).await?;
    Ok(Availability {
        sku_exists: true,
        available_quantity: available(product.stock_quantity, reserved),
    })
}

pub async fn available_quantity(
    tx: &mut Transaction<'_>,
    sku: &str,
) -> Result<Availability, StoreError> {
    match tx.find_product(sku).await? {
        Some(product) => availability_of(tx, &product).await,
        None => Ok(Availability::missing()),
    }
}

/// Read-only availability queries. Each query runs in its own transaction,
/// which is always rolled back.
#[derive(Clone)]
pub struct AvailabilityChecker {
    store: Arc<dyn StockStore>,
}

impl AvailabilityChecker {
    pub fn new(store: Arc<dyn StockStore>) -> Self {
        Self { store }
    }

    pub async fn availability(&self, sku: &str) -> Result<Availability, StoreError> {
        let mut tx = self.store.begin().await?;
        let result = available_quantity(&mut tx, sku).await;
        if let Err(e) = tx.rollback().await {
            warn!(sku, error = %e, "Failed to release read transaction");
        }
        result
    }

    pub async fn check(&self, sku: &str, quantity: i32) -> Result<AvailabilityReply, StoreError> {
        let availability = self.availability(sku).await?;
        debug!(
            sku,
            quantity,
            sku_exists = availability.sku_exists,
            available = availability.available_quantity,
            "Checked availability"
        );
        Ok(availability.reply(quantity))
    }
}
