use diesel::result::DatabaseErrorKind;
use diesel_async::pooled_connection::PoolError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::status::OrderStatus;

/// Infrastructure faults raised by any storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] bb8::RunError<PoolError>),

    #[error("storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StorageError {
    /// Whether repeating the same call may succeed without new input.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Timeout(_) | StorageError::Pool(_) => true,
            StorageError::Database(diesel::result::Error::DatabaseError(kind, _)) => matches!(
                kind,
                DatabaseErrorKind::SerializationFailure
                    | DatabaseErrorKind::ClosedConnection
                    | DatabaseErrorKind::UnableToSendCommand
            ),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Corrupt(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("{0}")]
    Validation(String),

    #[error("invalid variant: {0}")]
    InvalidVariant(Uuid),

    #[error("insufficient stock for variant {variant_id}. available: {available}, requested: {requested}")]
    InsufficientStock {
        variant_id: Uuid,
        available: i32,
        requested: i32,
    },

    #[error("reservation failed for order {order_id} on variant {variant_id}: {reason}")]
    ReservationFailed {
        order_id: Uuid,
        variant_id: Uuid,
        reason: String,
    },

    #[error("cannot move order from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("order {0} is still reserving stock")]
    ReservationPending(Uuid),

    #[error("forbidden")]
    Forbidden,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl OrderError {
    pub fn order_not_found(id: Uuid) -> Self {
        OrderError::NotFound { entity: "order", id }
    }

    /// Stable machine-readable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            OrderError::Validation(_) => "validation_error",
            OrderError::InvalidVariant(_) => "invalid_variant",
            OrderError::InsufficientStock { .. } => "insufficient_stock",
            OrderError::ReservationFailed { .. } => "reservation_failed",
            OrderError::InvalidTransition { .. } => "invalid_transition",
            OrderError::ReservationPending(_) => "reservation_pending",
            OrderError::Forbidden => "forbidden",
            OrderError::NotFound { .. } => "not_found",
            OrderError::Storage(_) => "storage_error",
        }
    }
}

/// Runs a storage call under a deadline, mapping expiry to [`StorageError::Timeout`].
pub async fn bounded<T, E, F>(limit: Duration, call: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: From<StorageError>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout(limit).into()),
    }
}
