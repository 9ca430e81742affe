use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ORDER_CREATED: &str = "order.created";
pub const CHECK_AVAILABILITY: &str = "inventory.check_availability";
/// Same query as [`CHECK_AVAILABILITY`], sent by producers addressing the product catalogue.
pub const PRODUCT_CHECK_AVAILABILITY: &str = "product.check_availability";

/// Header names carried on every broker message.
pub mod headers {
    pub const REDELIVERY_COUNT: &str = "x-redelivery-count";
    pub const REPLY_TO: &str = "reply-to";
    pub const CORRELATION_ID: &str = "correlation-id";
    pub const DEAD_LETTER_REASON: &str = "x-dead-letter-reason";
    pub const SOURCE_TOPIC: &str = "x-source-topic";
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: &'static str, value: i64 },
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

/// Wire envelope `{"pattern": ..., "data": ...}` shared by every producer of
/// inventory messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub pattern: String,
    pub data: serde_json::Value,
    /// Request id of request/reply producers. Stands in for the correlation
    /// id when the message carries no `correlation-id` header.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl MessageEnvelope {
    pub fn new<T: Serialize>(pattern: &str, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            pattern: pattern.to_string(),
            data: serde_json::to_value(data)?,
            id: None,
        })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes and validates the `data` field.
    pub fn data<T: Payload>(&self) -> Result<T, PayloadError> {
        let payload: T = serde_json::from_value(self.data.clone())?;
        payload.validate()?;
        Ok(payload)
    }
}

pub trait Payload: DeserializeOwned {
    fn validate(&self) -> Result<(), PayloadError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub sku: String,
    pub quantity: i32,
}

impl Payload for OrderCreated {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.order_id.is_empty() {
            return Err(PayloadError::Empty("orderId"));
        }
        if self.sku.is_empty() {
            return Err(PayloadError::Empty("sku"));
        }
        positive("quantity", self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckAvailability {
    pub sku: String,
    pub quantity: i32,
}

impl Payload for CheckAvailability {
    fn validate(&self) -> Result<(), PayloadError> {
        if self.sku.is_empty() {
            return Err(PayloadError::Empty("sku"));
        }
        positive("quantity", self.quantity)
    }
}

fn positive(field: &'static str, value: i32) -> Result<(), PayloadError> {
    if value <= 0 {
        return Err(PayloadError::NonPositive {
            field,
            value: i64::from(value),
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityReply {
    pub sku_exists: bool,
    pub has_available_stock: bool,
    pub available_quantity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationReplyStatus {
    Reserved,
    AlreadyReserved,
    InsufficientStock,
    SkuNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationReply {
    pub order_id: String,
    pub status: ReservationReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_quantity: Option<i64>,
}
