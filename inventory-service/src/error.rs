use thiserror::Error;
use uuid::Uuid;

/// Failures of the stock store itself, as opposed to domain outcomes.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("transaction conflict: {0}")]
    Conflict(String),
    #[error("duplicate key: {0}")]
    Duplicate(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Conflict(_) | Self::Database(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ProductError {
    #[error("Product with ID {0} not found")]
    NotFound(Uuid),
    #[error("A product with SKU {0} already exists")]
    DuplicateSku(String),
    #[error("invalid product: {0}")]
    Invalid(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_infrastructure_failures_are_transient() {
        assert!(StoreError::Unavailable("pool timed out".into()).is_transient());
        assert!(StoreError::Conflict("serialization failure".into()).is_transient());
        assert!(!StoreError::Duplicate("order_id".into()).is_transient());
        assert!(!StoreError::InvalidData("status".into()).is_transient());
    }
}
