use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use super::{StockStore, StockTransaction, Transaction};
use crate::error::{ProductError, StoreError};
use crate::models::*;

#[derive(Debug, Default)]
struct MemoryState {
    products: HashMap<Uuid, Product>,
    reservations: Vec<Reservation>,
}

impl MemoryState {
    fn product_by_sku(&self, sku: &str) -> Option<&Product> {
        self.products.values().find(|p| p.sku == sku)
    }
}

/// In-memory stock store for tests and local runs.
///
/// A transaction holds the whole store exclusively until it ends, which makes
/// every transaction serializable. Writes are staged and only become visible
/// on commit.
#[derive(Clone, Default)]
pub struct InMemoryStockStore {
    state: Arc<Mutex<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    failing_begins: Arc<AtomicUsize>,
}

impl InMemoryStockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `StoreError::Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `count` calls to `begin` fail with `StoreError::Unavailable`.
    pub fn fail_next_begins(&self, count: usize) {
        self.failing_begins.store(count, Ordering::SeqCst);
    }

    pub async fn reservations(&self) -> Vec<Reservation> {
        self.state.lock().await.reservations.clone()
    }

    /// Total quantity of RESERVED reservations for the SKU.
    pub async fn reserved_quantity(&self, sku: &str) -> i64 {
        active_sum(&self.state.lock().await.reservations, sku)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn active_sum<'a>(reservations: impl IntoIterator<Item = &'a Reservation>, sku: &str) -> i64 {
    reservations
        .into_iter()
        .filter(|r| r.sku == sku && r.status == ReservationStatus::Reserved)
        .map(|r| i64::from(r.quantity))
        .sum()
}

#[async_trait]
impl StockStore for InMemoryStockStore {
    async fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        self.check_available()?;
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected failure".to_string()));
        }
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Transaction::new(MemoryTransaction {
            guard,
            staged: Vec::new(),
        }))
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        self.check_available()?;
        let state = self.state.lock().await;
        let mut products: Vec<Product> = state.products.values().cloned().collect();
        products.sort_by(|a, b| a.sku.cmp(&b.sku));
        Ok(products)
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        self.check_available()?;
        Ok(self.state.lock().await.products.get(&id).cloned())
    }

    async fn create_product(&self, product: NewProduct) -> Result<Product, ProductError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        if state.product_by_sku(&product.sku).is_some() {
            return Err(ProductError::DuplicateSku(product.sku));
        }
        let now = Utc::now();
        let product = Product {
            id: product.id,
            sku: product.sku,
            name: product.name,
            description: product.description,
            price: product.price,
            stock_quantity: product.stock_quantity,
            created_at: Some(now),
            updated_at: Some(now),
        };
        state.products.insert(product.id, product.clone());
        Ok(product)
    }

    async fn update_product(
        &self,
        id: Uuid,
        changes: ProductChanges,
    ) -> Result<Option<Product>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let Some(product) = state.products.get_mut(&id) else {
            return Ok(None);
        };
        if !changes.is_empty() {
            changes.apply(product);
        }
        Ok(Some(product.clone()))
    }

    async fn delete_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let removed = state.products.remove(&id);
        if let Some(product) = &removed {
            state.reservations.retain(|r| r.sku != product.sku);
        }
        Ok(removed)
    }

    async fn set_reservation_status(
        &self,
        order_id: &str,
        status: ReservationStatus,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.reservations.iter_mut().find(|r| r.order_id == order_id) {
            Some(reservation) => {
                reservation.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

struct MemoryTransaction {
    guard: OwnedMutexGuard<MemoryState>,
    staged: Vec<Reservation>,
}

impl MemoryTransaction {
    fn all_reservations(&self) -> impl Iterator<Item = &Reservation> {
        self.guard.reservations.iter().chain(self.staged.iter())
    }
}

#[async_trait]
impl StockTransaction for MemoryTransaction {
    async fn find_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        Ok(self.guard.product_by_sku(sku).cloned())
    }

    async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        // The whole store is already held by this transaction.
        self.find_product(sku).await
    }

    async fn find_reservation(&mut self, order_id: &str) -> Result<Option<Reservation>, StoreError> {
        Ok(self
            .all_reservations()
            .find(|r| r.order_id == order_id)
            .cloned())
    }

    async fn sum_active_reservations(&mut self, sku: &str) -> Result<i64, StoreError> {
        Ok(active_sum(self.all_reservations(), sku))
    }

    async fn insert_reservation(&mut self, reservation: NewReservation) -> Result<(), StoreError> {
        if self
            .all_reservations()
            .any(|r| r.order_id == reservation.order_id)
        {
            return Err(StoreError::Duplicate(format!(
                "reservation for order {} already exists",
                reservation.order_id
            )));
        }
        if self.guard.product_by_sku(&reservation.sku).is_none() {
            return Err(StoreError::Database(format!(
                "no product with sku {}",
                reservation.sku
            )));
        }
        self.staged.push(Reservation {
            id: reservation.id,
            order_id: reservation.order_id,
            sku: reservation.sku,
            quantity: reservation.quantity,
            status: ReservationStatus::parse(&reservation.status)?,
            created_at: Some(Utc::now()),
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let staged = std::mem::take(&mut self.staged);
        self.guard.reservations.extend(staged);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.staged.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigdecimal::BigDecimal;

    async fn seeded(stock: i32) -> InMemoryStockStore {
        let store = InMemoryStockStore::new();
        store
            .create_product(NewProduct {
                id: Uuid::new_v4(),
                sku: "SKU-A".to_string(),
                name: "Widget".to_string(),
                description: None,
                price: BigDecimal::from(3),
                stock_quantity: stock,
            })
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn staged_reservations_are_invisible_until_commit() {
        let store = seeded(10).await;

        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(NewReservation::reserved("o-1", "SKU-A", 4))
            .await
            .unwrap();
        assert_eq!(tx.sum_active_reservations("SKU-A").await.unwrap(), 4);
        tx.rollback().await.unwrap();
        assert_eq!(store.reserved_quantity("SKU-A").await, 0);

        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(NewReservation::reserved("o-1", "SKU-A", 4))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.reserved_quantity("SKU-A").await, 4);
    }

    #[tokio::test]
    async fn dropped_transaction_discards_writes() {
        let store = seeded(10).await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.insert_reservation(NewReservation::reserved("o-1", "SKU-A", 2))
                .await
                .unwrap();
        }
        assert!(store.reservations().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_order_id_is_rejected() {
        let store = seeded(10).await;
        let mut tx = store.begin().await.unwrap();
        tx.insert_reservation(NewReservation::reserved("o-1", "SKU-A", 1))
            .await
            .unwrap();
        let err = tx
            .insert_reservation(NewReservation::reserved("o-1", "SKU-A", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let store = seeded(1).await;
        store.fail_next_begins(1);
        assert!(matches!(store.begin().await, Err(StoreError::Unavailable(_))));
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_sku_is_reported() {
        let store = seeded(1).await;
        let err = store
            .create_product(NewProduct {
                id: Uuid::new_v4(),
                sku: "SKU-A".to_string(),
                name: "Other".to_string(),
                description: None,
                price: BigDecimal::from(1),
                stock_quantity: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProductError::DuplicateSku(sku) if sku == "SKU-A"));
    }
}
