//! Per-variant stock ledger: on-hand quantity plus units reserved by unfulfilled orders.
//!
//! Every mutation keeps `reserved_quantity <= quantity`. Reservations are a single
//! conditional increment, so concurrent checkouts cannot oversell a variant.
//!
//! Orders reserve through [`InventoryLedger::reserve_line`], which records each claim under
//! its `(order_id, line)` key. Repeating a call for a key that is already held changes
//! nothing, so a reservation whose outcome was lost to a timeout can be retried safely.

use async_trait::async_trait;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use shared::StorageError;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub mod handlers;
pub mod memory;
pub mod models;
pub mod schema;

pub use handlers::PgInventoryLedger;
pub use memory::InMemoryInventoryLedger;
pub use models::{InventoryRecord, Reservation};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("variant {0} is not tracked in inventory")]
    NotTracked(Uuid),

    #[error("variant {0} does not exist in the catalog")]
    UnknownVariant(Uuid),

    #[error("insufficient stock for variant {variant_id}. available: {available}, requested: {requested}")]
    Insufficient {
        variant_id: Uuid,
        available: i32,
        requested: i32,
    },

    #[error("quantity {quantity} for variant {variant_id} is below the {reserved} reserved units")]
    QuantityBelowReserved {
        variant_id: Uuid,
        quantity: i32,
        reserved: i32,
    },

    #[error("reservation for {key} is already {status}")]
    ReservationClosed { key: ReservationKey, status: String },

    #[error("invalid amount: {0}")]
    InvalidAmount(i32),

    #[error("stock update for variant {0} changes nothing")]
    EmptyUpdate(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Storage(e) if e.is_transient())
    }

    /// Rewrites a foreign key violation on `variant_id` into [`LedgerError::UnknownVariant`].
    pub fn for_variant(self, variant_id: Uuid) -> Self {
        match self {
            LedgerError::Storage(StorageError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::ForeignKeyViolation,
                _,
            ))) => LedgerError::UnknownVariant(variant_id),
            other => other,
        }
    }

    pub(crate) fn is_unique_violation(&self) -> bool {
        matches!(
            self,
            LedgerError::Storage(StorageError::Database(DieselError::DatabaseError(
                DatabaseErrorKind::UniqueViolation,
                _
            )))
        )
    }
}

impl From<DieselError> for LedgerError {
    fn from(e: DieselError) -> Self {
        LedgerError::Storage(StorageError::Database(e))
    }
}

pub(crate) fn check_amount(amount: i32) -> Result<(), LedgerError> {
    if amount < 1 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}

/// One order line's claim on stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationKey {
    pub order_id: Uuid,
    pub line: i32,
}

impl ReservationKey {
    pub fn new(order_id: Uuid, line: i32) -> Self {
        Self { order_id, line }
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "order {} line {}", self.order_id, self.line)
    }
}

/// Administrative change to a variant's stock settings, applied all or nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StockUpdate {
    pub quantity: Option<i32>,
    pub low_stock_threshold: Option<i32>,
}

impl StockUpdate {
    pub fn validate(&self, variant_id: Uuid) -> Result<(), LedgerError> {
        if self.quantity.is_none() && self.low_stock_threshold.is_none() {
            return Err(LedgerError::EmptyUpdate(variant_id));
        }
        for value in [self.quantity, self.low_stock_threshold].into_iter().flatten() {
            if value < 0 {
                return Err(LedgerError::InvalidAmount(value));
            }
        }
        Ok(())
    }
}

#[async_trait]
pub trait InventoryLedger: Send + Sync {
    async fn get(&self, variant_id: Uuid) -> Result<Option<InventoryRecord>, LedgerError>;

    async fn list(&self) -> Result<Vec<InventoryRecord>, LedgerError>;

    /// `quantity - reserved_quantity`; an untracked variant has nothing available.
    async fn available(&self, variant_id: Uuid) -> Result<i32, LedgerError> {
        Ok(self
            .get(variant_id)
            .await?
            .map(|record| record.available())
            .unwrap_or(0))
    }

    /// Claims `amount` units, failing without side effects when fewer are available.
    async fn reserve(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError>;

    /// Returns `amount` reserved units to the available pool. Never drops below zero.
    async fn release(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError>;

    /// Converts a reservation into a stock deduction once the goods have left.
    async fn fulfil(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError>;

    /// Reserves `amount` units for one order line and records the claim in the same step.
    /// A key that is already held is returned unchanged; a released or fulfilled key fails
    /// with [`LedgerError::ReservationClosed`].
    async fn reserve_line(
        &self,
        key: ReservationKey,
        variant_id: Uuid,
        amount: i32,
    ) -> Result<Reservation, LedgerError>;

    /// Releases every reservation the order still holds. Returns the ones released by this call.
    async fn release_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError>;

    /// Fulfils every reservation the order still holds. Returns the ones fulfilled by this call.
    async fn fulfil_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError>;

    /// All reservations recorded for the order, in line order.
    async fn reservations(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError>;

    /// Applies every field of `update` in one step, creating the record on first use.
    /// Nothing is written when any field is rejected.
    async fn update_stock(&self, variant_id: Uuid, update: StockUpdate) -> Result<InventoryRecord, LedgerError>;

    /// Administrative absolute set of on-hand stock.
    async fn set_quantity(&self, variant_id: Uuid, quantity: i32) -> Result<InventoryRecord, LedgerError> {
        self.update_stock(
            variant_id,
            StockUpdate {
                quantity: Some(quantity),
                low_stock_threshold: None,
            },
        )
        .await
    }

    async fn set_low_stock_threshold(
        &self,
        variant_id: Uuid,
        threshold: i32,
    ) -> Result<InventoryRecord, LedgerError> {
        self.update_stock(
            variant_id,
            StockUpdate {
                quantity: None,
                low_stock_threshold: Some(threshold),
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn foreign_key_violation_means_unknown_variant() {
        let variant_id = Uuid::new_v4();
        let fk = LedgerError::from(DieselError::DatabaseError(
            DatabaseErrorKind::ForeignKeyViolation,
            Box::new("insert or update on table \"inventory\" violates foreign key constraint".to_string()),
        ));
        assert!(matches!(fk.for_variant(variant_id), LedgerError::UnknownVariant(id) if id == variant_id));

        let other = LedgerError::from(DieselError::NotFound).for_variant(variant_id);
        assert!(matches!(other, LedgerError::Storage(_)));
    }

    #[test]
    fn stock_update_is_validated_as_a_whole() {
        let variant_id = Uuid::new_v4();
        assert!(matches!(
            StockUpdate::default().validate(variant_id),
            Err(LedgerError::EmptyUpdate(_))
        ));
        assert!(matches!(
            StockUpdate { quantity: Some(12), low_stock_threshold: Some(-1) }.validate(variant_id),
            Err(LedgerError::InvalidAmount(-1))
        ));
        assert!(StockUpdate { quantity: Some(0), low_stock_threshold: None }
            .validate(variant_id)
            .is_ok());
    }
}
