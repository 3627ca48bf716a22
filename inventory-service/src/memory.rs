use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::{reservation_status, InventoryRecord, Reservation};
use crate::{check_amount, InventoryLedger, LedgerError, ReservationKey, StockUpdate};

#[derive(Debug, Default)]
struct Books {
    records: HashMap<Uuid, InventoryRecord>,
    reservations: HashMap<ReservationKey, Reservation>,
}

impl Books {
    fn record_mut(&mut self, variant_id: Uuid) -> Result<&mut InventoryRecord, LedgerError> {
        self.records
            .get_mut(&variant_id)
            .ok_or(LedgerError::NotTracked(variant_id))
    }

    fn held_keys(&self, order_id: Uuid) -> Vec<ReservationKey> {
        let mut keys: Vec<_> = self
            .reservations
            .iter()
            .filter(|(key, r)| key.order_id == order_id && r.is_held())
            .map(|(key, _)| *key)
            .collect();
        keys.sort_by_key(|key| key.line);
        keys
    }

    /// Marks every held reservation of the order with `status`, applying `settle` to its stock.
    fn close_order(
        &mut self,
        order_id: Uuid,
        status: &str,
        settle: fn(&mut InventoryRecord, i32),
    ) -> Vec<Reservation> {
        let mut closed = Vec::new();
        for key in self.held_keys(order_id) {
            let Some(reservation) = self.reservations.get_mut(&key) else {
                continue;
            };
            if let Some(record) = self.records.get_mut(&reservation.variant_id) {
                settle(record, reservation.quantity);
                touch(record);
            }
            reservation.status = status.to_string();
            reservation.updated_at = Some(Utc::now());
            closed.push(reservation.clone());
        }
        closed
    }
}

fn touch(record: &mut InventoryRecord) -> InventoryRecord {
    record.updated_at = Some(Utc::now());
    record.clone()
}

fn release_units(record: &mut InventoryRecord, amount: i32) {
    record.reserved_quantity = (record.reserved_quantity - amount).max(0);
}

fn fulfil_units(record: &mut InventoryRecord, amount: i32) {
    let consumed = amount.min(record.reserved_quantity);
    record.quantity -= consumed;
    record.reserved_quantity -= consumed;
}

/// Ledger kept in process memory. Each operation holds the lock for its whole
/// check-and-update, which gives the same atomicity as the conditional SQL update.
#[derive(Debug, Default)]
pub struct InMemoryInventoryLedger {
    books: Mutex<Books>,
}

impl InMemoryInventoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InventoryLedger for InMemoryInventoryLedger {
    async fn get(&self, variant_id: Uuid) -> Result<Option<InventoryRecord>, LedgerError> {
        Ok(self.books.lock().await.records.get(&variant_id).cloned())
    }

    async fn list(&self) -> Result<Vec<InventoryRecord>, LedgerError> {
        let mut records: Vec<_> = self.books.lock().await.records.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn reserve(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError> {
        check_amount(amount)?;
        let mut books = self.books.lock().await;
        let record = books.record_mut(variant_id)?;

        if record.available() < amount {
            return Err(LedgerError::Insufficient {
                variant_id,
                available: record.available(),
                requested: amount,
            });
        }

        record.reserved_quantity += amount;
        Ok(touch(record))
    }

    async fn release(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError> {
        check_amount(amount)?;
        let mut books = self.books.lock().await;
        let record = books.record_mut(variant_id)?;
        release_units(record, amount);
        Ok(touch(record))
    }

    async fn fulfil(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError> {
        check_amount(amount)?;
        let mut books = self.books.lock().await;
        let record = books.record_mut(variant_id)?;
        fulfil_units(record, amount);
        Ok(touch(record))
    }

    async fn reserve_line(
        &self,
        key: ReservationKey,
        variant_id: Uuid,
        amount: i32,
    ) -> Result<Reservation, LedgerError> {
        check_amount(amount)?;
        let mut books = self.books.lock().await;

        if let Some(existing) = books.reservations.get(&key) {
            if existing.is_held() {
                return Ok(existing.clone());
            }
            return Err(LedgerError::ReservationClosed {
                key,
                status: existing.status.clone(),
            });
        }

        let record = books.record_mut(variant_id)?;
        if record.available() < amount {
            return Err(LedgerError::Insufficient {
                variant_id,
                available: record.available(),
                requested: amount,
            });
        }
        record.reserved_quantity += amount;
        touch(record);

        let reservation = Reservation::new(key.order_id, key.line, variant_id, amount);
        books.reservations.insert(key, reservation.clone());
        Ok(reservation)
    }

    async fn release_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        let mut books = self.books.lock().await;
        Ok(books.close_order(order_id, reservation_status::RELEASED, release_units))
    }

    async fn fulfil_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        let mut books = self.books.lock().await;
        Ok(books.close_order(order_id, reservation_status::FULFILLED, fulfil_units))
    }

    async fn reservations(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        let books = self.books.lock().await;
        let mut reservations: Vec<_> = books
            .reservations
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        reservations.sort_by_key(|r| r.line);
        Ok(reservations)
    }

    async fn update_stock(&self, variant_id: Uuid, update: StockUpdate) -> Result<InventoryRecord, LedgerError> {
        update.validate(variant_id)?;
        let mut books = self.books.lock().await;
        let reserved = books
            .records
            .get(&variant_id)
            .map_or(0, |record| record.reserved_quantity);

        if let Some(quantity) = update.quantity {
            if quantity < reserved {
                return Err(LedgerError::QuantityBelowReserved {
                    variant_id,
                    quantity,
                    reserved,
                });
            }
        }

        let record = books
            .records
            .entry(variant_id)
            .or_insert_with(|| InventoryRecord::new(variant_id, 0));
        if let Some(quantity) = update.quantity {
            record.quantity = quantity;
        }
        if let Some(threshold) = update.low_stock_threshold {
            record.low_stock_threshold = threshold;
        }
        Ok(touch(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn ledger_with(quantity: i32) -> (InMemoryInventoryLedger, Uuid) {
        let ledger = InMemoryInventoryLedger::new();
        let variant_id = Uuid::new_v4();
        ledger.set_quantity(variant_id, quantity).await.unwrap();
        (ledger, variant_id)
    }

    #[tokio::test]
    async fn untracked_variant_has_nothing_available() {
        let ledger = InMemoryInventoryLedger::new();
        assert_eq!(ledger.available(Uuid::new_v4()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reserve_claims_available_stock() {
        let (ledger, variant_id) = ledger_with(5).await;

        let record = ledger.reserve(variant_id, 3).await.unwrap();
        assert_eq!(record.reserved_quantity, 3);
        assert_eq!(ledger.available(variant_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn reserve_beyond_available_changes_nothing() {
        let (ledger, variant_id) = ledger_with(2).await;

        let err = ledger.reserve(variant_id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Insufficient { available: 2, requested: 3, .. }
        ));
        assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 0);
    }

    #[tokio::test]
    async fn reserve_on_untracked_variant_fails() {
        let ledger = InMemoryInventoryLedger::new();
        let variant_id = Uuid::new_v4();
        assert!(matches!(
            ledger.reserve(variant_id, 1).await,
            Err(LedgerError::NotTracked(id)) if id == variant_id
        ));
    }

    #[tokio::test]
    async fn non_positive_amounts_are_rejected() {
        let (ledger, variant_id) = ledger_with(5).await;
        assert!(matches!(ledger.reserve(variant_id, 0).await, Err(LedgerError::InvalidAmount(0))));
        assert!(matches!(ledger.release(variant_id, -1).await, Err(LedgerError::InvalidAmount(-1))));
    }

    #[tokio::test]
    async fn release_never_goes_below_zero() {
        let (ledger, variant_id) = ledger_with(5).await;
        ledger.reserve(variant_id, 2).await.unwrap();

        let record = ledger.release(variant_id, 10).await.unwrap();
        assert_eq!(record.reserved_quantity, 0);
        assert_eq!(record.quantity, 5);
    }

    #[tokio::test]
    async fn fulfil_deducts_reserved_units_from_stock() {
        let (ledger, variant_id) = ledger_with(5).await;
        ledger.reserve(variant_id, 3).await.unwrap();

        let record = ledger.fulfil(variant_id, 3).await.unwrap();
        assert_eq!(record.quantity, 2);
        assert_eq!(record.reserved_quantity, 0);
        assert_eq!(record.available(), 2);
    }

    #[tokio::test]
    async fn quantity_cannot_drop_below_reservations() {
        let (ledger, variant_id) = ledger_with(5).await;
        ledger.reserve(variant_id, 4).await.unwrap();

        let err = ledger.set_quantity(variant_id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::QuantityBelowReserved { quantity: 3, reserved: 4, .. }
        ));

        let record = ledger.set_quantity(variant_id, 4).await.unwrap();
        assert_eq!(record.available(), 0);
    }

    #[tokio::test]
    async fn threshold_update_creates_missing_record() {
        let ledger = InMemoryInventoryLedger::new();
        let variant_id = Uuid::new_v4();

        let record = ledger.set_low_stock_threshold(variant_id, 3).await.unwrap();
        assert_eq!(record.quantity, 0);
        assert_eq!(record.low_stock_threshold, 3);
        assert_eq!(ledger.list().await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_oversell() {
        let ledger = Arc::new(InMemoryInventoryLedger::new());
        let variant_id = Uuid::new_v4();
        ledger.set_quantity(variant_id, 10).await.unwrap();

        let tasks = (0..50).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.reserve(variant_id, 1).await })
        });
        let results = futures::future::join_all(tasks).await;

        let mut successes = 0;
        for result in results {
            match result.unwrap() {
                Ok(_) => successes += 1,
                Err(e) => assert!(matches!(e, LedgerError::Insufficient { available: 0, requested: 1, .. })),
            }
        }

        let record = ledger.get(variant_id).await.unwrap().unwrap();
        assert_eq!(successes, 10);
        assert_eq!(record.reserved_quantity, 10);
        assert_eq!(record.available(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_line_reservations_never_oversell() {
        let ledger = Arc::new(InMemoryInventoryLedger::new());
        let variant_id = Uuid::new_v4();
        ledger.set_quantity(variant_id, 7).await.unwrap();

        let tasks = (0..30).map(|_| {
            let ledger = ledger.clone();
            tokio::spawn(async move {
                let key = ReservationKey::new(Uuid::new_v4(), 0);
                ledger.reserve_line(key, variant_id, 1).await.is_ok()
            })
        });
        let successes = futures::future::join_all(tasks)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(successes, 7);
        assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 7);
    }

    #[tokio::test]
    async fn repeated_line_reservation_is_a_no_op() {
        let (ledger, variant_id) = ledger_with(5).await;
        let key = ReservationKey::new(Uuid::new_v4(), 0);

        let first = ledger.reserve_line(key, variant_id, 3).await.unwrap();
        let second = ledger.reserve_line(key, variant_id, 3).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 3);
        assert_eq!(ledger.reservations(key.order_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn release_order_only_touches_recorded_lines() {
        let (ledger, variant_id) = ledger_with(10).await;
        let order = Uuid::new_v4();
        let other = Uuid::new_v4();
        ledger.reserve_line(ReservationKey::new(order, 0), variant_id, 2).await.unwrap();
        ledger.reserve_line(ReservationKey::new(order, 1), variant_id, 3).await.unwrap();
        ledger.reserve_line(ReservationKey::new(other, 0), variant_id, 4).await.unwrap();

        let released = ledger.release_order(order).await.unwrap();
        assert_eq!(released.iter().map(|r| r.line).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 4);

        // Nothing left to release the second time round.
        assert!(ledger.release_order(order).await.unwrap().is_empty());
        assert_eq!(ledger.get(variant_id).await.unwrap().unwrap().reserved_quantity, 4);

        let err = ledger
            .reserve_line(ReservationKey::new(order, 0), variant_id, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::ReservationClosed { status, .. } if status == "released"));
    }

    #[tokio::test]
    async fn fulfil_order_deducts_held_units() {
        let (ledger, variant_id) = ledger_with(10).await;
        let order = Uuid::new_v4();
        ledger.reserve_line(ReservationKey::new(order, 0), variant_id, 3).await.unwrap();

        let fulfilled = ledger.fulfil_order(order).await.unwrap();
        assert_eq!(fulfilled.len(), 1);
        assert!(!fulfilled[0].is_held());

        let record = ledger.get(variant_id).await.unwrap().unwrap();
        assert_eq!(record.quantity, 7);
        assert_eq!(record.reserved_quantity, 0);
        assert!(ledger.release_order(order).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejected_stock_update_writes_nothing() {
        let (ledger, variant_id) = ledger_with(5).await;

        let update = StockUpdate {
            quantity: Some(12),
            low_stock_threshold: Some(-1),
        };
        assert!(matches!(
            ledger.update_stock(variant_id, update).await,
            Err(LedgerError::InvalidAmount(-1))
        ));

        let record = ledger.get(variant_id).await.unwrap().unwrap();
        assert_eq!(record.quantity, 5);
        assert_eq!(record.low_stock_threshold, crate::models::DEFAULT_LOW_STOCK_THRESHOLD);

        let record = ledger
            .update_stock(
                variant_id,
                StockUpdate {
                    quantity: Some(12),
                    low_stock_threshold: Some(3),
                },
            )
            .await
            .unwrap();
        assert_eq!((record.quantity, record.low_stock_threshold), (12, 3));
    }
}
