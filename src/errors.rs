use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// A single outstanding line item reported by `IncompleteOrders`.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ShortLine {
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub quantity_needed: i32,
    pub quantity_packed: i32,
}

impl ShortLine {
    pub fn short_by(&self) -> i32 {
        self.quantity_needed - self.quantity_packed
    }
}

/// Coarse classification of a `ServiceError`, used by callers to decide
/// how to react. Only `Concurrency` is ever auto-retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; rejected synchronously, never retried.
    Validation,
    /// A legitimate business boundary (stock exhausted, counter at its
    /// bound); surfaced for a decision, never retried.
    Capacity,
    /// Transient write conflict; safe to retry a bounded number of times
    /// against fresh state.
    Concurrency,
    /// A protected invariant; never bypassed.
    Integrity,
    /// Everything else (database, channel, bugs).
    Internal,
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("No fulfillment-eligible orders in input set")]
    NoEligibleOrders,

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("No unpacked units remain in the session basket for product {product_id}")]
    NoUnitsAvailable { session_id: Uuid, product_id: Uuid },

    #[error("Product {product_id} is already fully picked ({quantity_needed} needed)")]
    AlreadyFullyPicked {
        session_id: Uuid,
        product_id: Uuid,
        quantity_needed: i32,
    },

    #[error("Order {order_id} already has its full quantity of product {product_id} packed")]
    AlreadyFullyPacked {
        order_id: Uuid,
        product_id: Uuid,
        quantity_needed: i32,
    },

    #[error("Concurrent modification of {0}, retry the operation")]
    ConcurrencyConflict(String),

    #[error("Order {0} has already affected stock; cancel it before deleting")]
    StockAlreadyAffected(Uuid),

    #[error("Session has {} incompletely packed line item(s)", .0.len())]
    IncompleteOrders(Vec<ShortLine>),

    #[error("Invalid status transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    /// Returns the error classification.
    /// This is the single source of truth for error-to-kind mapping;
    /// retry loops must consult it rather than matching variants.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ValidationError(_)
            | Self::NoEligibleOrders
            | Self::InvalidStatus(_)
            | Self::InvalidOperation(_)
            | Self::NotFound(_) => ErrorKind::Validation,
            Self::InsufficientStock(_)
            | Self::NoUnitsAvailable { .. }
            | Self::AlreadyFullyPicked { .. }
            | Self::AlreadyFullyPacked { .. } => ErrorKind::Capacity,
            Self::ConcurrencyConflict(_) => ErrorKind::Concurrency,
            Self::StockAlreadyAffected(_)
            | Self::IncompleteOrders(_)
            | Self::InvalidTransition { .. } => ErrorKind::Integrity,
            Self::DatabaseError(_)
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether an automatic bounded retry is appropriate.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Concurrency
    }
}

/// Flattens sea-orm's transaction error wrapper back into `ServiceError`.
pub fn flatten_transaction_error(err: sea_orm::TransactionError<ServiceError>) -> ServiceError {
    match err {
        sea_orm::TransactionError::Connection(db_err) => ServiceError::DatabaseError(db_err),
        sea_orm::TransactionError::Transaction(service_err) => service_err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_concurrency_conflicts_are_retryable() {
        let conflict = ServiceError::ConcurrencyConflict("picking_progress".into());
        assert!(conflict.is_retryable());

        let capacity = ServiceError::InsufficientStock("product x".into());
        assert!(!capacity.is_retryable());
        assert_eq!(capacity.kind(), ErrorKind::Capacity);

        let integrity = ServiceError::StockAlreadyAffected(Uuid::new_v4());
        assert_eq!(integrity.kind(), ErrorKind::Integrity);
        assert!(!integrity.is_retryable());
    }

    #[test]
    fn short_line_reports_outstanding_quantity() {
        let line = ShortLine {
            order_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            quantity_needed: 5,
            quantity_packed: 3,
        };
        assert_eq!(line.short_by(), 2);
    }
}
