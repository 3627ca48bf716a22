use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_LOW_STOCK_THRESHOLD: i32 = 10;

#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory)]
pub struct InventoryRecord {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub reserved_quantity: i32,
    pub low_stock_threshold: i32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl InventoryRecord {
    pub fn new(variant_id: Uuid, quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            variant_id,
            quantity,
            reserved_quantity: 0,
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn available(&self) -> i32 {
        (self.quantity - self.reserved_quantity).max(0)
    }

    pub fn is_low_stock(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::inventory)]
pub struct NewInventoryRecord {
    pub id: Uuid,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub reserved_quantity: i32,
    pub low_stock_threshold: i32,
}

impl NewInventoryRecord {
    pub fn empty(variant_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            variant_id,
            quantity: 0,
            reserved_quantity: 0,
            low_stock_threshold: DEFAULT_LOW_STOCK_THRESHOLD,
        }
    }
}

/// Only the columns an administrative stock update may touch. `None` leaves a column as is.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::inventory)]
pub struct StockChanges {
    pub quantity: Option<i32>,
    pub low_stock_threshold: Option<i32>,
    pub updated_at: Option<DateTime<Utc>>,
}

pub mod reservation_status {
    pub const RESERVED: &str = "reserved";
    pub const RELEASED: &str = "released";
    pub const FULFILLED: &str = "fulfilled";
}

/// Units held for one order line. Keyed by `(order_id, line)`.
#[derive(Debug, Clone, PartialEq, Queryable, Identifiable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::inventory_reservations)]
pub struct Reservation {
    pub id: Uuid,
    pub order_id: Uuid,
    pub line: i32,
    pub variant_id: Uuid,
    pub quantity: i32,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn new(order_id: Uuid, line: i32, variant_id: Uuid, quantity: i32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            order_id,
            line,
            variant_id,
            quantity,
            status: reservation_status::RESERVED.to_string(),
            created_at: Some(now),
            updated_at: Some(now),
        }
    }

    pub fn is_held(&self) -> bool {
        self.status == reservation_status::RESERVED
    }
}
