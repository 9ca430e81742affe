//! Delivery bookkeeping for at-least-once message consumption.
//!
//! A [`Delivery`] moves through RECEIVED → PROCESSING and ends in exactly one
//! of ACKNOWLEDGED, REQUEUED or DEAD_LETTERED. Which one is decided by a
//! [`Disposition`]; the broker side effects are performed through a
//! [`DeliveryChannel`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::backoff::Backoff;

/// Acknowledgment handle of one delivery. Only valid on the broker session
/// that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeliveryTag {
    pub session: u64,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]@{} (session {})",
            self.topic, self.partition, self.offset, self.session
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTo {
    pub destination: String,
    pub correlation_id: Option<String>,
}

/// One attempt at delivering a message. Not `Clone`: settling a delivery
/// consumes it.
#[derive(Debug)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub redelivery_count: u32,
    pub reply_to: Option<ReplyTo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Processing,
    Acknowledged,
    Requeued,
    DeadLettered,
}

impl MessageState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Acknowledged | Self::Requeued | Self::DeadLettered
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acknowledge { reply: Option<Vec<u8>> },
    Requeue { redelivery_count: u32, delay: Duration },
    DeadLetter { reason: String },
}

impl Disposition {
    pub fn state(&self) -> MessageState {
        match self {
            Self::Acknowledge { .. } => MessageState::Acknowledged,
            Self::Requeue { .. } => MessageState::Requeued,
            Self::DeadLetter { .. } => MessageState::DeadLettered,
        }
    }
}

/// How many times a message that failed transiently is redelivered before
/// it is dead-lettered, and how long to wait before each redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeliveryPolicy {
    pub max_redeliveries: u32,
    pub backoff: Backoff,
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            max_redeliveries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RedeliveryPolicy {
    pub fn on_transient_failure(&self, redelivery_count: u32, error: &str) -> Disposition {
        if redelivery_count < self.max_redeliveries {
            Disposition::Requeue {
                redelivery_count: redelivery_count + 1,
                delay: self.backoff.delay_for_attempt(redelivery_count),
            }
        } else {
            Disposition::DeadLetter {
                reason: format!(
                    "gave up after {redelivery_count} redeliveries: {error}"
                ),
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker I/O failure: {0}")]
    Io(String),
    #[error("delivery tag {tag} does not belong to the current session {current}")]
    StaleTag { tag: DeliveryTag, current: u64 },
}

/// Broker side effects for settling deliveries.
///
/// `requeue` and `dead_letter` both publish a copy of the message and then
/// acknowledge the original, so after any one of `ack`, `requeue` or
/// `dead_letter` returns `Ok` the original delivery is resolved.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Republishes the message to its source with the given redelivery count.
    async fn requeue(&self, delivery: &Delivery, redelivery_count: u32) -> Result<(), BrokerError>;

    /// Publishes the message once to the dead-letter destination.
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> Result<(), BrokerError>;

    async fn reply(&self, to: &ReplyTo, payload: &[u8]) -> Result<(), BrokerError>;
}
