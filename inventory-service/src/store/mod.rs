//! Durable storage for products and reservations.
//!
//! All reservation logic goes through a [`Transaction`]: an explicit handle
//! that the caller must finish with [`Transaction::commit`] or
//! [`Transaction::rollback`]. A handle dropped without either is rolled back
//! by the backing store.

mod memory;
mod postgres;

pub use memory::InMemoryStockStore;
pub use postgres::PgStockStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{ProductError, StoreError};
use crate::models::{
    NewProduct, NewReservation, Product, ProductChanges, Reservation, ReservationStatus,
};

#[async_trait]
pub trait StockStore: Send + Sync {
    async fn begin(&self) -> Result<Transaction<'_>, StoreError>;

    async fn list_products(&self) -> Result<Vec<Product>, StoreError>;

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError>;

    async fn create_product(&self, product: NewProduct) -> Result<Product, ProductError>;

    async fn update_product(
        &self,
        id: Uuid,
        changes: ProductChanges,
    ) -> Result<Option<Product>, StoreError>;

    /// Deletes the product and, with it, every reservation on its SKU.
    async fn delete_product(&self, id: Uuid) -> Result<Option<Product>, StoreError>;

    /// Moves a reservation to a new status. Used by the fulfilment and
    /// cancellation flows; returns false when no reservation has that order id.
    async fn set_reservation_status(
        &self,
        order_id: &str,
        status: ReservationStatus,
    ) -> Result<bool, StoreError>;
}

/// Operations available inside one store transaction.
#[async_trait]
pub trait StockTransaction: Send {
    async fn find_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError>;

    /// Like `find_product`, but holds a lock on the SKU until the transaction
    /// ends so concurrent reservations for it are serialized.
    async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError>;

    async fn find_reservation(&mut self, order_id: &str) -> Result<Option<Reservation>, StoreError>;

    /// Sum of quantities of RESERVED reservations for the SKU.
    async fn sum_active_reservations(&mut self, sku: &str) -> Result<i64, StoreError>;

    async fn insert_reservation(&mut self, reservation: NewReservation) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}

pub struct Transaction<'a> {
    inner: Box<dyn StockTransaction + 'a>,
}

impl<'a> Transaction<'a> {
    pub fn new(inner: impl StockTransaction + 'a) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }

    pub async fn find_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        self.inner.find_product(sku).await
    }

    pub async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        self.inner.lock_product(sku).await
    }

    pub async fn find_reservation(
        &mut self,
        order_id: &str,
    ) -> Result<Option<Reservation>, StoreError> {
        self.inner.find_reservation(order_id).await
    }

    pub async fn sum_active_reservations(&mut self, sku: &str) -> Result<i64, StoreError> {
        self.inner.sum_active_reservations(sku).await
    }

    pub async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<(), StoreError> {
        self.inner.insert_reservation(reservation).await
    }

    pub async fn commit(mut self) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    pub async fn rollback(mut self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}
