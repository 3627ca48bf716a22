use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel_async::{pooled_connection::bb8::Pool, AsyncConnection, AsyncPgConnection, RunQueryDsl};
use shared::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::*;
use crate::schema::*;

type DbPool = Pool<AsyncPgConnection>;

/// The mutable part of an order: status plus its bookkeeping columns.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub status: OrderStatus,
    pub cancel_reason: Option<CancelReason>,
    pub notes: Option<String>,
}

pub fn format_order_number(sequence: i64) -> String {
    format!("ORD-{}-{:06}", Utc::now().timestamp_millis(), sequence)
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn next_order_number(&self) -> Result<String, StorageError>;

    /// Persists a new order together with its line items and returns it as stored.
    /// Inserting an id that already exists leaves the stored order untouched, so a retry
    /// after an ambiguous failure is safe.
    async fn insert(&self, order: Order) -> Result<Order, StorageError>;

    /// Finds an order, including one that is still reserving stock.
    async fn find(&self, id: Uuid) -> Result<Option<Order>, StorageError>;

    /// Newest first. `None` lists every user's orders. Orders still reserving stock are left out.
    async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<Order>, StorageError>;

    /// Ends the reservation phase of a pending order. With `cancel` set the order is
    /// cancelled for that reason in the same write. Returns `None` unless the order was
    /// pending and still reserving.
    async fn settle_reservation(
        &self,
        id: Uuid,
        cancel: Option<CancelReason>,
    ) -> Result<Option<Order>, StorageError>;

    /// Applies `change` only if the stored status is still `from` and the order has
    /// finished reserving. Returns `None` when the order is missing or another writer got
    /// there first.
    async fn update_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        change: StatusChange,
    ) -> Result<Option<Order>, StorageError>;

    async fn ping(&self) -> Result<(), StorageError>;
}

pub struct PgOrderStore {
    pool: DbPool,
    timeout: Duration,
}

impl PgOrderStore {
    pub fn new(pool: DbPool, timeout: Duration) -> Self {
        Self { pool, timeout }
    }

    async fn load_items(
        conn: &mut AsyncPgConnection,
        order_ids: Vec<Uuid>,
    ) -> Result<HashMap<Uuid, Vec<DbOrderItem>>, StorageError> {
        let rows = order_items::table
            .filter(order_items::order_id.eq_any(order_ids))
            .order((order_items::order_id.asc(), order_items::position.asc()))
            .load::<DbOrderItem>(conn)
            .await?;

        let mut grouped: HashMap<Uuid, Vec<DbOrderItem>> = HashMap::new();
        for row in rows {
            grouped.entry(row.order_id).or_default().push(row);
        }
        Ok(grouped)
    }

    async fn hydrate(conn: &mut AsyncPgConnection, rows: Vec<DbOrder>) -> Result<Vec<Order>, StorageError> {
        let mut items = Self::load_items(conn, rows.iter().map(|r| r.id).collect()).await?;
        rows.into_iter()
            .map(|row| {
                let lines = items.remove(&row.id).unwrap_or_default();
                row.into_order(lines)
            })
            .collect()
    }

    async fn hydrate_one(conn: &mut AsyncPgConnection, row: Option<DbOrder>) -> Result<Option<Order>, StorageError> {
        match row {
            Some(row) => Ok(Self::hydrate(conn, vec![row]).await?.pop()),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl OrderStore for PgOrderStore {
    async fn next_order_number(&self) -> Result<String, StorageError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let sequence = diesel::select(diesel::dsl::sql::<BigInt>("nextval('order_number_seq')"))
                .get_result::<i64>(&mut conn)
                .await?;
            Ok::<_, StorageError>(format_order_number(sequence))
        })
        .await
    }

    async fn insert(&self, order: Order) -> Result<Order, StorageError> {
        let new_order = NewOrder::from(&order);
        let items = DbOrderItem::rows_for(&order)?;
        let id = order.id;

        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            conn.transaction::<_, StorageError, _>(|conn| {
                Box::pin(async move {
                    diesel::insert_into(orders::table)
                        .values(&new_order)
                        .on_conflict(orders::id)
                        .do_nothing()
                        .execute(conn)
                        .await?;

                    diesel::insert_into(order_items::table)
                        .values(&items)
                        .on_conflict((order_items::order_id, order_items::position))
                        .do_nothing()
                        .execute(conn)
                        .await?;

                    // Money columns round to their declared scale; hand back what was stored.
                    let row = orders::table
                        .filter(orders::id.eq(id))
                        .first::<DbOrder>(conn)
                        .await
                        .optional()?;
                    Self::hydrate_one(conn, row)
                        .await?
                        .ok_or_else(|| StorageError::Corrupt(format!("order {} missing after insert", id)))
                })
            })
            .await
        })
        .await
    }

    async fn find(&self, id: Uuid) -> Result<Option<Order>, StorageError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let row = orders::table
                .filter(orders::id.eq(id))
                .first::<DbOrder>(&mut conn)
                .await
                .optional()?;
            Self::hydrate_one(&mut conn, row).await
        })
        .await
    }

    async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<Order>, StorageError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let mut query = orders::table
                .filter(orders::reserving.eq(false))
                .order(orders::created_at.desc())
                .into_boxed();
            if let Some(user_id) = user_id {
                query = query.filter(orders::user_id.eq(user_id));
            }
            let rows = query.load::<DbOrder>(&mut conn).await?;
            Self::hydrate(&mut conn, rows).await
        })
        .await
    }

    async fn settle_reservation(
        &self,
        id: Uuid,
        cancel: Option<CancelReason>,
    ) -> Result<Option<Order>, StorageError> {
        let settlement = ReservationSettlement {
            reserving: false,
            status: cancel.map(|_| OrderStatus::Cancelled.as_str().to_string()),
            cancel_reason: cancel.map(|r| r.as_str().to_string()),
            updated_at: Some(Utc::now()),
        };

        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let row = diesel::update(
                orders::table
                    .filter(orders::id.eq(id))
                    .filter(orders::status.eq(OrderStatus::Pending.as_str()))
                    .filter(orders::reserving.eq(true)),
            )
            .set(&settlement)
            .get_result::<DbOrder>(&mut conn)
            .await
            .optional()?;
            Self::hydrate_one(&mut conn, row).await
        })
        .await
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        change: StatusChange,
    ) -> Result<Option<Order>, StorageError> {
        let changeset = OrderStatusChange {
            status: change.status.as_str().to_string(),
            cancel_reason: change.cancel_reason.map(|r| r.as_str().to_string()),
            notes: change.notes,
            updated_at: Some(Utc::now()),
        };

        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            let row = diesel::update(
                orders::table
                    .filter(orders::id.eq(id))
                    .filter(orders::status.eq(from.as_str()))
                    .filter(orders::reserving.eq(false)),
            )
            .set(&changeset)
            .get_result::<DbOrder>(&mut conn)
            .await
            .optional()?;
            Self::hydrate_one(&mut conn, row).await
        })
        .await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        bounded(self.timeout, async {
            let mut conn = self.pool.get().await?;
            diesel::select(diesel::dsl::sql::<BigInt>("1::bigint"))
                .get_result::<i64>(&mut conn)
                .await?;
            Ok::<_, StorageError>(())
        })
        .await
    }
}

#[derive(Debug, Default)]
pub struct InMemoryOrderStore {
    orders: RwLock<Vec<Order>>,
    sequence: AtomicI64,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn next_order_number(&self) -> Result<String, StorageError> {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format_order_number(sequence))
    }

    async fn insert(&self, order: Order) -> Result<Order, StorageError> {
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders.iter().find(|o| o.id == order.id) {
            return Ok(existing.clone());
        }
        if orders.iter().any(|o| o.order_number == order.order_number) {
            return Err(StorageError::Corrupt(format!(
                "duplicate order number {}",
                order.order_number
            )));
        }
        orders.push(order.clone());
        Ok(order)
    }

    async fn find(&self, id: Uuid) -> Result<Option<Order>, StorageError> {
        Ok(self.orders.read().await.iter().find(|o| o.id == id).cloned())
    }

    async fn list(&self, user_id: Option<Uuid>) -> Result<Vec<Order>, StorageError> {
        let orders = self.orders.read().await;
        // Insertion order is creation order, so reversing gives newest first.
        Ok(orders
            .iter()
            .rev()
            .filter(|o| !o.reserving)
            .filter(|o| user_id.map_or(true, |uid| o.user_id == uid))
            .cloned()
            .collect())
    }

    async fn settle_reservation(
        &self,
        id: Uuid,
        cancel: Option<CancelReason>,
    ) -> Result<Option<Order>, StorageError> {
        let mut orders = self.orders.write().await;
        let Some(order) = orders
            .iter_mut()
            .find(|o| o.id == id && o.status == OrderStatus::Pending && o.reserving)
        else {
            return Ok(None);
        };

        order.reserving = false;
        if let Some(reason) = cancel {
            order.status = OrderStatus::Cancelled;
            order.cancel_reason = Some(reason);
        }
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn update_status(
        &self,
        id: Uuid,
        from: OrderStatus,
        change: StatusChange,
    ) -> Result<Option<Order>, StorageError> {
        let mut orders = self.orders.write().await;
        let Some(order) = orders
            .iter_mut()
            .find(|o| o.id == id && o.status == from && !o.reserving)
        else {
            return Ok(None);
        };

        order.status = change.status;
        if let Some(reason) = change.cancel_reason {
            order.cancel_reason = Some(reason);
        }
        if let Some(notes) = change.notes {
            order.notes = Some(notes);
        }
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
