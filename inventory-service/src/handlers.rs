use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::{bounded, StorageError};
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;
use crate::{check_amount, InventoryLedger, LedgerError, ReservationKey, StockUpdate};

type DbPool = Pool<AsyncPgConnection>;

/// PostgreSQL-backed ledger. `reserve` is one conditional `UPDATE`; the other
/// mutations lock the row inside a transaction. Order reservations are recorded in
/// `inventory_reservations` in the same transaction as the stock change.
pub struct PgInventoryLedger {
    pool: DbPool,
    timeout: Duration,
}

impl PgInventoryLedger {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn lock_row(
        conn: &mut AsyncPgConnection,
        variant_id: Uuid,
    ) -> Result<Option<InventoryRecord>, LedgerError> {
        let record = inventory::table
            .filter(inventory::variant_id.eq(variant_id))
            .for_update()
            .first::<InventoryRecord>(conn)
            .await
            .optional()?;
        Ok(record)
    }

    async fn ensure_row(conn: &mut AsyncPgConnection, variant_id: Uuid) -> Result<InventoryRecord, LedgerError> {
        diesel::insert_into(inventory::table)
            .values(&NewInventoryRecord::empty(variant_id))
            .on_conflict(inventory::variant_id)
            .do_nothing()
            .execute(conn)
            .await?;

        Self::lock_row(conn, variant_id)
            .await?
            .ok_or(LedgerError::NotTracked(variant_id))
    }

    /// Conditional increment of `reserved_quantity`. Reports why when the guard rejects it.
    async fn claim(
        conn: &mut AsyncPgConnection,
        variant_id: Uuid,
        amount: i32,
    ) -> Result<InventoryRecord, LedgerError> {
        let reserved = diesel::update(
            inventory::table
                .filter(inventory::variant_id.eq(variant_id))
                .filter((inventory::quantity - inventory::reserved_quantity).ge(amount)),
        )
        .set((
            inventory::reserved_quantity.eq(inventory::reserved_quantity + amount),
            inventory::updated_at.eq(Some(Utc::now())),
        ))
        .get_result::<InventoryRecord>(conn)
        .await
        .optional()?;

        if let Some(record) = reserved {
            return Ok(record);
        }

        let current = inventory::table
            .filter(inventory::variant_id.eq(variant_id))
            .first::<InventoryRecord>(conn)
            .await
            .optional()?;

        match current {
            Some(record) => Err(LedgerError::Insufficient {
                variant_id,
                available: record.available(),
                requested: amount,
            }),
            None => Err(LedgerError::NotTracked(variant_id)),
        }
    }

    async fn find_reservation(
        conn: &mut AsyncPgConnection,
        key: ReservationKey,
    ) -> Result<Option<Reservation>, LedgerError> {
        let reservation = inventory_reservations::table
            .filter(inventory_reservations::order_id.eq(key.order_id))
            .filter(inventory_reservations::line.eq(key.line))
            .first::<Reservation>(conn)
            .await
            .optional()?;
        Ok(reservation)
    }

    /// Closes every held reservation of the order under row locks, moving its units with `settle`.
    async fn close_order(
        &self,
        order_id: Uuid,
        status: &'static str,
        settle: fn(&InventoryRecord, i32) -> (i32, i32),
    ) -> Result<Vec<Reservation>, LedgerError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            conn.transaction::<_, LedgerError, _>(|conn| {
                Box::pin(async move {
                    let held = inventory_reservations::table
                        .filter(inventory_reservations::order_id.eq(order_id))
                        .filter(inventory_reservations::status.eq(reservation_status::RESERVED))
                        .order(inventory_reservations::line.asc())
                        .for_update()
                        .load::<Reservation>(conn)
                        .await?;

                    let mut closed = Vec::with_capacity(held.len());
                    for reservation in held {
                        if let Some(record) = Self::lock_row(conn, reservation.variant_id).await? {
                            let (quantity, reserved) = settle(&record, reservation.quantity);
                            diesel::update(inventory::table.filter(inventory::id.eq(record.id)))
                                .set((
                                    inventory::quantity.eq(quantity),
                                    inventory::reserved_quantity.eq(reserved),
                                    inventory::updated_at.eq(Some(Utc::now())),
                                ))
                                .execute(conn)
                                .await?;
                        }

                        let updated = diesel::update(
                            inventory_reservations::table.filter(inventory_reservations::id.eq(reservation.id)),
                        )
                        .set((
                            inventory_reservations::status.eq(status),
                            inventory_reservations::updated_at.eq(Some(Utc::now())),
                        ))
                        .get_result::<Reservation>(conn)
                        .await?;
                        closed.push(updated);
                    }
                    Ok(closed)
                })
            })
            .await
        })
        .await
    }
}

fn release_units(record: &InventoryRecord, amount: i32) -> (i32, i32) {
    (record.quantity, (record.reserved_quantity - amount).max(0))
}

fn fulfil_units(record: &InventoryRecord, amount: i32) -> (i32, i32) {
    let consumed = amount.min(record.reserved_quantity);
    (record.quantity - consumed, record.reserved_quantity - consumed)
}

#[async_trait]
impl InventoryLedger for PgInventoryLedger {
    async fn get(&self, variant_id: Uuid) -> Result<Option<InventoryRecord>, LedgerError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            let record = inventory::table
                .filter(inventory::variant_id.eq(variant_id))
                .first::<InventoryRecord>(&mut conn)
                .await
                .optional()?;
            Ok::<_, LedgerError>(record)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<InventoryRecord>, LedgerError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            let records = inventory::table
                .order(inventory::created_at.asc())
                .load::<InventoryRecord>(&mut conn)
                .await?;
            Ok::<_, LedgerError>(records)
        })
        .await
    }

    async fn reserve(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError> {
        check_amount(amount)?;

        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            let record = Self::claim(&mut conn, variant_id, amount).await?;
            debug!(%variant_id, amount, reserved = record.reserved_quantity, "Reserved inventory");
            Ok::<_, LedgerError>(record)
        })
        .await
    }

    async fn release(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError> {
        check_amount(amount)?;

        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            conn.transaction::<_, LedgerError, _>(|conn| {
                Box::pin(async move {
                    let record = Self::lock_row(conn, variant_id)
                        .await?
                        .ok_or(LedgerError::NotTracked(variant_id))?;
                    let (_, remaining) = release_units(&record, amount);

                    let updated = diesel::update(inventory::table.filter(inventory::id.eq(record.id)))
                        .set((
                            inventory::reserved_quantity.eq(remaining),
                            inventory::updated_at.eq(Some(Utc::now())),
                        ))
                        .get_result::<InventoryRecord>(conn)
                        .await?;
                    Ok(updated)
                })
            })
            .await
        })
        .await
    }

    async fn fulfil(&self, variant_id: Uuid, amount: i32) -> Result<InventoryRecord, LedgerError> {
        check_amount(amount)?;

        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            conn.transaction::<_, LedgerError, _>(|conn| {
                Box::pin(async move {
                    let record = Self::lock_row(conn, variant_id)
                        .await?
                        .ok_or(LedgerError::NotTracked(variant_id))?;
                    let (quantity, reserved) = fulfil_units(&record, amount);

                    let updated = diesel::update(inventory::table.filter(inventory::id.eq(record.id)))
                        .set((
                            inventory::quantity.eq(quantity),
                            inventory::reserved_quantity.eq(reserved),
                            inventory::updated_at.eq(Some(Utc::now())),
                        ))
                        .get_result::<InventoryRecord>(conn)
                        .await?;
                    Ok(updated)
                })
            })
            .await
        })
        .await
    }

    async fn reserve_line(
        &self,
        key: ReservationKey,
        variant_id: Uuid,
        amount: i32,
    ) -> Result<Reservation, LedgerError> {
        check_amount(amount)?;

        let attempt = bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            conn.transaction::<_, LedgerError, _>(|conn| {
                Box::pin(async move {
                    if let Some(existing) = Self::find_reservation(conn, key).await? {
                        return held_or_closed(key, existing);
                    }

                    let record = Self::claim(conn, variant_id, amount).await?;
                    let reservation = Reservation::new(key.order_id, key.line, variant_id, amount);
                    diesel::insert_into(inventory_reservations::table)
                        .values(&reservation)
                        .execute(conn)
                        .await?;

                    debug!(%key, %variant_id, amount, reserved = record.reserved_quantity, "Reserved order line");
                    Ok(reservation)
                })
            })
            .await
        })
        .await;

        match attempt {
            // A concurrent retry of the same line committed first; its row is the answer.
            Err(e) if e.is_unique_violation() => bounded(self.timeout, async {
                let mut conn = self.pool.get().await.map_err(StorageError::from)?;
                match Self::find_reservation(&mut conn, key).await? {
                    Some(existing) => held_or_closed(key, existing),
                    None => Err(e),
                }
            })
            .await,
            other => other,
        }
    }

    async fn release_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        let released = self
            .close_order(order_id, reservation_status::RELEASED, release_units)
            .await?;
        if !released.is_empty() {
            info!(%order_id, lines = released.len(), "Released order reservations");
        }
        Ok(released)
    }

    async fn fulfil_order(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        let fulfilled = self
            .close_order(order_id, reservation_status::FULFILLED, fulfil_units)
            .await?;
        if !fulfilled.is_empty() {
            info!(%order_id, lines = fulfilled.len(), "Fulfilled order reservations");
        }
        Ok(fulfilled)
    }

    async fn reservations(&self, order_id: Uuid) -> Result<Vec<Reservation>, LedgerError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            let reservations = inventory_reservations::table
                .filter(inventory_reservations::order_id.eq(order_id))
                .order(inventory_reservations::line.asc())
                .load::<Reservation>(&mut conn)
                .await?;
            Ok::<_, LedgerError>(reservations)
        })
        .await
    }

    async fn update_stock(&self, variant_id: Uuid, update: StockUpdate) -> Result<InventoryRecord, LedgerError> {
        update.validate(variant_id)?;

        let record = bounded(self.timeout, async {
            let mut conn = self.pool.get().await.map_err(StorageError::from)?;
            conn.transaction::<_, LedgerError, _>(|conn| {
                Box::pin(async move {
                    let record = Self::ensure_row(conn, variant_id).await?;
                    if let Some(quantity) = update.quantity {
                        if quantity < record.reserved_quantity {
                            return Err(LedgerError::QuantityBelowReserved {
                                variant_id,
                                quantity,
                                reserved: record.reserved_quantity,
                            });
                        }
                    }

                    let changes = StockChanges {
                        quantity: update.quantity,
                        low_stock_threshold: update.low_stock_threshold,
                        updated_at: Some(Utc::now()),
                    };
                    let updated = diesel::update(inventory::table.filter(inventory::id.eq(record.id)))
                        .set(&changes)
                        .get_result::<InventoryRecord>(conn)
                        .await?;
                    Ok(updated)
                })
            })
            .await
        })
        .await
        .map_err(|e| e.for_variant(variant_id))?;

        info!(
            %variant_id,
            quantity = record.quantity,
            low_stock_threshold = record.low_stock_threshold,
            "Inventory stock updated"
        );
        Ok(record)
    }
}

fn held_or_closed(key: ReservationKey, existing: Reservation) -> Result<Reservation, LedgerError> {
    if existing.is_held() {
        Ok(existing)
    } else {
        Err(LedgerError::ReservationClosed {
            key,
            status: existing.status,
        })
    }
}
