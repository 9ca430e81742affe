use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AnsiTransactionManager, AsyncPgConnection, RunQueryDsl, TransactionManager};
use tracing::warn;
use uuid::Uuid;

use super::{StockStore, StockTransaction, Transaction};
use crate::error::{ProductError, StoreError};
use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;
type PooledConnection =
    bb8::PooledConnection<'static, AsyncDieselConnectionManager<AsyncPgConnection>>;

#[derive(Clone)]
pub struct PgStockStore {
    pool: DbPool,
}

impl PgStockStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<PooledConnection, StoreError> {
        self.pool
            .get_owned()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}

impl From<DieselError> for StoreError {
    fn from(err: DieselError) -> Self {
        match &err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, info) => {
                StoreError::Duplicate(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, info) => {
                StoreError::Conflict(info.message().to_string())
            }
            DieselError::DatabaseError(DatabaseErrorKind::ClosedConnection, _)
            | DieselError::BrokenTransactionManager => StoreError::Unavailable(err.to_string()),
            DieselError::DeserializationError(_) => StoreError::InvalidData(err.to_string()),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

#[async_trait]
impl StockStore for PgStockStore {
    async fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let mut conn = self.connection().await?;
        AnsiTransactionManager::begin_transaction(&mut *conn).await?;
        Ok(Transaction::new(PgTransaction { conn, open: true }))
    }

    async fn list_products(&self) -> Result<Vec<Product>, StoreError> {
        let mut conn = self.connection().await?;
        let products = products::table
            .order(products::sku.asc())
            .load::<Product>(&mut *conn)
            .await?;
        Ok(products)
    }

    async fn get_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        let mut conn = self.connection().await?;
        let product = products::table
            .find(id)
            .first::<Product>(&mut *conn)
            .await
            .optional()?;
        Ok(product)
    }

    async fn create_product(&self, product: NewProduct) -> Result<Product, ProductError> {
        let mut conn = self.connection().await?;
        let sku = product.sku.clone();
        diesel::insert_into(products::table)
            .values(&product)
            .get_result::<Product>(&mut *conn)
            .await
            .map_err(|e| match StoreError::from(e) {
                StoreError::Duplicate(_) => ProductError::DuplicateSku(sku),
                other => ProductError::Store(other),
            })
    }

    async fn update_product(
        &self,
        id: Uuid,
        changes: ProductChanges,
    ) -> Result<Option<Product>, StoreError> {
        if changes.is_empty() {
            return self.get_product(id).await;
        }
        let mut conn = self.connection().await?;
        let product = diesel::update(products::table.find(id))
            .set((&changes, products::updated_at.eq(Utc::now())))
            .get_result::<Product>(&mut *conn)
            .await
            .optional()?;
        Ok(product)
    }

    async fn delete_product(&self, id: Uuid) -> Result<Option<Product>, StoreError> {
        let mut conn = self.connection().await?;
        let product = diesel::delete(products::table.find(id))
            .get_result::<Product>(&mut *conn)
            .await
            .optional()?;
        Ok(product)
    }

    async fn set_reservation_status(
        &self,
        order_id: &str,
        status: ReservationStatus,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let updated = diesel::update(
            stock_reservations::table.filter(stock_reservations::order_id.eq(order_id)),
        )
        .set((
            stock_reservations::status.eq(status.as_str()),
            stock_reservations::updated_at.eq(Utc::now()),
        ))
        .execute(&mut *conn)
        .await?;
        Ok(updated > 0)
    }
}

/// A Postgres transaction pinned to one pooled connection.
///
/// If dropped while still open, the pool sees a connection with an open
/// transaction and discards it instead of recycling it, which makes the
/// server roll the transaction back.
struct PgTransaction {
    conn: PooledConnection,
    open: bool,
}

#[async_trait]
impl StockTransaction for PgTransaction {
    async fn find_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        let product = products::table
            .filter(products::sku.eq(sku))
            .first::<Product>(&mut *self.conn)
            .await
            .optional()?;
        Ok(product)
    }

    async fn lock_product(&mut self, sku: &str) -> Result<Option<Product>, StoreError> {
        let product = products::table
            .filter(products::sku.eq(sku))
            .for_update()
            .first::<Product>(&mut *self.conn)
            .await
            .optional()?;
        Ok(product)
    }

    async fn find_reservation(&mut self, order_id: &str) -> Result<Option<Reservation>, StoreError> {
        let row = stock_reservations::table
            .filter(stock_reservations::order_id.eq(order_id))
            .first::<ReservationRow>(&mut *self.conn)
            .await
            .optional()?;
        row.map(Reservation::try_from).transpose()
    }

    async fn sum_active_reservations(&mut self, sku: &str) -> Result<i64, StoreError> {
        let reserved = stock_reservations::table
            .filter(stock_reservations::sku.eq(sku))
            .filter(stock_reservations::status.eq(ReservationStatus::Reserved.as_str()))
            .select(diesel::dsl::sum(stock_reservations::quantity))
            .first::<Option<i64>>(&mut *self.conn)
            .await?;
        Ok(reserved.unwrap_or(0))
    }

    async fn insert_reservation(&mut self, reservation: NewReservation) -> Result<(), StoreError> {
        diesel::insert_into(stock_reservations::table)
            .values(&reservation)
            .execute(&mut *self.conn)
            .await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.open = false;
        AnsiTransactionManager::commit_transaction(&mut *self.conn).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.open = false;
        AnsiTransactionManager::rollback_transaction(&mut *self.conn).await?;
        Ok(())
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if self.open {
            warn!("Transaction dropped without commit or rollback, discarding connection");
        }
    }
}
