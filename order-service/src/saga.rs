//! Reservation saga run after an order is persisted.
//!
//! Each line is reserved under its own `(order, line)` key, so a retried call whose first
//! attempt did commit claims nothing twice. Transient failures are retried a bounded number
//! of times; any other failure stops the saga and the caller compensates by releasing
//! whatever the ledger recorded for the order.

use inventory_service::{InventoryLedger, LedgerError, ReservationKey};
use shared::{CancelReason, LineItem, OrderError};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReservationPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for ReservationPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(50),
        }
    }
}

impl ReservationPolicy {
    /// Runs `op` until it succeeds, fails permanently, or runs out of attempts.
    /// Only use this for calls that are safe to repeat.
    pub async fn retry<T, E, F, Fut>(&self, what: &str, is_transient: impl Fn(&E) -> bool, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if is_transient(&e) && attempt < self.max_attempts => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        what, attempt, self.max_attempts, e, self.backoff
                    );
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[derive(Debug)]
pub struct ReservationFailure {
    pub variant_id: Uuid,
    pub error: LedgerError,
}

impl ReservationFailure {
    pub fn cancel_reason(&self) -> CancelReason {
        match self.error {
            LedgerError::Insufficient { .. } => CancelReason::InsufficientStock,
            _ => CancelReason::ReservationFailed,
        }
    }

    /// A lost race for stock is reported with the ledger's numbers so the caller can
    /// retry with a smaller quantity; everything else is a reservation failure.
    pub fn into_order_error(self, order_id: Uuid) -> OrderError {
        match self.error {
            LedgerError::Insufficient {
                variant_id,
                available,
                requested,
            } => OrderError::InsufficientStock {
                variant_id,
                available,
                requested,
            },
            other => OrderError::ReservationFailed {
                order_id,
                variant_id: self.variant_id,
                reason: other.to_string(),
            },
        }
    }
}

pub struct ReservationSaga<'a> {
    ledger: &'a dyn InventoryLedger,
    policy: &'a ReservationPolicy,
    order_id: Uuid,
    reserved_lines: usize,
}

impl<'a> ReservationSaga<'a> {
    pub fn new(ledger: &'a dyn InventoryLedger, policy: &'a ReservationPolicy, order_id: Uuid) -> Self {
        Self {
            ledger,
            policy,
            order_id,
            reserved_lines: 0,
        }
    }

    pub fn reserved_lines(&self) -> usize {
        self.reserved_lines
    }

    /// Reserves every line, stopping at the first line that cannot be reserved.
    pub async fn reserve_all(&mut self, items: &[LineItem]) -> Result<(), ReservationFailure> {
        let ledger = self.ledger;
        for (line, item) in items.iter().enumerate() {
            let key = ReservationKey::new(self.order_id, line as i32);
            let (variant_id, quantity) = (item.variant_id, item.quantity);

            let reserved = self
                .policy
                .retry("Reservation", LedgerError::is_transient, move || {
                    ledger.reserve_line(key, variant_id, quantity)
                })
                .await;

            match reserved {
                Ok(_) => self.reserved_lines += 1,
                Err(error) => {
                    warn!(
                        order_id = %self.order_id,
                        %variant_id,
                        line,
                        reserved = self.reserved_lines,
                        "Reservation failed: {}", error
                    );
                    return Err(ReservationFailure { variant_id, error });
                }
            }
        }
        Ok(())
    }

    /// Releases whatever the ledger holds for this order. Lines the saga never reached,
    /// or whose outcome was lost, are covered because the ledger's records are the source
    /// of truth. A failure here leaks stock and is logged as such.
    pub async fn compensate(&self) -> Result<usize, LedgerError> {
        let ledger = self.ledger;
        let order_id = self.order_id;
        match self
            .policy
            .retry("Compensation", LedgerError::is_transient, move || ledger.release_order(order_id))
            .await
        {
            Ok(released) => {
                info!(%order_id, released = released.len(), "Released reservations during compensation");
                Ok(released.len())
            }
            Err(e) => {
                error!(%order_id, "Data integrity: failed to release reservations during compensation: {}", e);
                Err(e)
            }
        }
    }
}
