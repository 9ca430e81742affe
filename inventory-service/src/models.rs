use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{ProductError, StoreError};

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock_quantity: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Body of a product create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductDraft {
    pub sku: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock_quantity: i32,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::products)]
pub struct NewProduct {
    pub id: Uuid,
    pub sku: String,
    pub name: String,
    pub description: Option<String>,
    pub price: BigDecimal,
    pub stock_quantity: i32,
}

impl TryFrom<ProductDraft> for NewProduct {
    type Error = ProductError;

    fn try_from(draft: ProductDraft) -> Result<Self, Self::Error> {
        if draft.sku.trim().is_empty() {
            return Err(ProductError::Invalid("sku must not be empty".to_string()));
        }
        if draft.name.trim().is_empty() {
            return Err(ProductError::Invalid("name must not be empty".to_string()));
        }
        check_price(&draft.price)?;
        check_stock(draft.stock_quantity)?;

        Ok(Self {
            id: Uuid::new_v4(),
            sku: draft.sku,
            name: draft.name,
            description: draft.description,
            price: draft.price,
            stock_quantity: draft.stock_quantity,
        })
    }
}

/// Partial product update. Only these fields may change; the SKU is immutable,
/// so any `sku` in the request body is ignored.
#[derive(Debug, Clone, Default, Deserialize, AsChangeset)]
#[diesel(table_name = crate::schema::products)]
#[serde(rename_all = "camelCase")]
pub struct ProductChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub price: Option<BigDecimal>,
    pub stock_quantity: Option<i32>,
}

impl ProductChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.price.is_none()
            && self.stock_quantity.is_none()
    }

    pub fn validate(&self) -> Result<(), ProductError> {
        if let Some(price) = &self.price {
            check_price(price)?;
        }
        if let Some(stock) = self.stock_quantity {
            check_stock(stock)?;
        }
        Ok(())
    }

    pub fn apply(self, product: &mut Product) {
        if let Some(name) = self.name {
            product.name = name;
        }
        if let Some(description) = self.description {
            product.description = Some(description);
        }
        if let Some(price) = self.price {
            product.price = price;
        }
        if let Some(stock) = self.stock_quantity {
            product.stock_quantity = stock;
        }
        product.updated_at = Some(Utc::now());
    }
}

fn check_price(price: &BigDecimal) -> Result<(), ProductError> {
    if *price < BigDecimal::from(0) {
        return Err(ProductError::Invalid("price must not be negative".to_string()));
    }
    Ok(())
}

fn check_stock(stock: i32) -> Result<(), ProductError> {
    if stock < 0 {
        return Err(ProductError::Invalid(format!(
            "stockQuantity must not be negative, got {stock}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Reserved,
    Released,
    Consumed,
}

impl ReservationStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "RESERVED",
            Self::Released => "RELEASED",
            Self::Consumed => "CONSUMED",
        }
    }

    pub fn parse(s: &str) -> Result<Self, StoreError> {
        match s {
            "RESERVED" => Ok(Self::Reserved),
            "RELEASED" => Ok(Self::Released),
            "CONSUMED" => Ok(Self::Consumed),
            other => Err(StoreError::InvalidData(format!(
                "unknown reservation status: {other}"
            ))),
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: String,
    pub sku: String,
    pub quantity: i32,
    pub status: ReservationStatus,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = crate::schema::stock_reservations)]
pub struct ReservationRow {
    pub id: Uuid,
    pub order_id: String,
    pub sku: String,
    pub quantity: i32,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = StoreError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            order_id: row.order_id,
            sku: row.sku,
            quantity: row.quantity,
            status: ReservationStatus::parse(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::stock_reservations)]
pub struct NewReservation {
    pub id: Uuid,
    pub order_id: String,
    pub sku: String,
    pub quantity: i32,
    pub status: String,
}

impl NewReservation {
    pub fn reserved(order_id: &str, sku: &str, quantity: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: order_id.to_string(),
            sku: sku.to_string(),
            quantity,
            status: ReservationStatus::Reserved.as_str().to_string(),
        }
    }
}
