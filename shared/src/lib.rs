use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

pub mod error;
pub mod status;

pub use error::{bounded, OrderError, StorageError};
pub use status::{CancelReason, OrderStatus};

/// A catalog attribute value. Only scalar kinds survive into an order snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(serde_json::Number),
    Text(String),
}

impl AttributeValue {
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(AttributeValue::Bool(*b)),
            serde_json::Value::Number(n) => Some(AttributeValue::Number(n.clone())),
            serde_json::Value::String(s) => Some(AttributeValue::Text(s.clone())),
            _ => None,
        }
    }
}

pub type Attributes = BTreeMap<String, AttributeValue>;

/// Splits a free-form JSON object into scalar attributes and the keys that had to be dropped.
pub fn attributes_from_json(value: &serde_json::Value) -> (Attributes, Vec<String>) {
    let mut attributes = Attributes::new();
    let mut dropped = Vec::new();

    if let serde_json::Value::Object(map) = value {
        for (key, raw) in map {
            match AttributeValue::from_json(raw) {
                Some(v) => {
                    attributes.insert(key.clone(), v);
                }
                None => dropped.push(key.clone()),
            }
        }
    }

    (attributes, dropped)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub variant_id: Uuid,
    pub product_name: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
    pub variant_attributes: Attributes,
}

impl LineItem {
    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub items: Vec<LineItem>,
    pub subtotal: BigDecimal,
    pub shipping_cost: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
    pub status: OrderStatus,
    pub cancel_reason: Option<CancelReason>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set while stock is still being reserved. Such orders are not visible to queries and
    /// refuse status changes.
    #[serde(skip)]
    pub reserving: bool,
}

impl Order {
    pub fn is_owned_by(&self, user_id: Uuid) -> bool {
        self.user_id == user_id
    }
}

/// Decimal places kept for every monetary amount.
pub const MONEY_SCALE: i64 = 2;

/// Exclusive upper bound on any monetary amount, matching `NUMERIC(12, 2)` storage.
pub fn money_limit() -> BigDecimal {
    BigDecimal::from(10_000_000_000i64)
}

/// Accepts a non-negative amount with at most two decimal places, returned at that scale.
pub fn validate_money(field: &str, value: &BigDecimal) -> Result<BigDecimal, OrderError> {
    if value < &BigDecimal::zero() {
        return Err(OrderError::Validation(format!("{} must not be negative", field)));
    }
    let (_, scale) = value.normalized().as_bigint_and_exponent();
    if scale > MONEY_SCALE {
        return Err(OrderError::Validation(format!(
            "{} must have at most {} decimal places",
            field, MONEY_SCALE
        )));
    }
    if value >= &money_limit() {
        return Err(OrderError::Validation(format!("{} is too large", field)));
    }
    Ok(value.with_scale(MONEY_SCALE))
}

/// A validated order that has not been persisted yet. Totals are fixed here.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub items: Vec<LineItem>,
    pub subtotal: BigDecimal,
    pub shipping_cost: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
}

impl OrderDraft {
    pub fn new(
        user_id: Uuid,
        address_id: Uuid,
        items: Vec<LineItem>,
        shipping_cost: BigDecimal,
        tax: BigDecimal,
    ) -> Self {
        let subtotal = items
            .iter()
            .fold(BigDecimal::zero(), |acc, item| acc + item.line_total())
            .with_scale(MONEY_SCALE);
        let shipping_cost = shipping_cost.with_scale(MONEY_SCALE);
        let tax = tax.with_scale(MONEY_SCALE);
        let total = &subtotal + &shipping_cost + &tax;

        Self {
            user_id,
            address_id,
            items,
            subtotal,
            shipping_cost,
            tax,
            total,
        }
    }

    /// Rejects drafts whose total does not fit the stored money columns.
    pub fn check_limits(&self) -> Result<(), OrderError> {
        if self.total >= money_limit() {
            return Err(OrderError::Validation(format!(
                "order total {} exceeds the supported maximum",
                self.total
            )));
        }
        Ok(())
    }

    pub fn into_order(self, order_number: String) -> Order {
        let now = Utc::now();
        Order {
            id: Uuid::new_v4(),
            order_number,
            user_id: self.user_id,
            address_id: self.address_id,
            items: self.items,
            subtotal: self.subtotal,
            shipping_cost: self.shipping_cost,
            tax: self.tax,
            total: self.total,
            status: OrderStatus::Pending,
            cancel_reason: None,
            notes: None,
            created_at: now,
            updated_at: now,
            reserving: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRequest {
    pub variant_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub address_id: Option<Uuid>,
    #[serde(default)]
    pub items: Vec<ItemRequest>,
    pub shipping_cost: Option<BigDecimal>,
    pub tax: Option<BigDecimal>,
}

pub mod permissions {
    pub const ORDERS_READ_ANY: &str = "orders:read:any";
    pub const ORDERS_MANAGE: &str = "orders:manage";
    pub const INVENTORY_MANAGE: &str = "inventory:manage";
}

/// The authenticated caller as resolved by the upstream gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    permissions: BTreeSet<String>,
}

impl Principal {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            permissions: BTreeSet::new(),
        }
    }

    pub fn with_permissions<I, S>(user_id: Uuid, permissions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id,
            permissions: permissions.into_iter().map(Into::into).collect(),
        }
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.contains(permission)
    }

    pub fn is_elevated(&self) -> bool {
        self.has_permission(permissions::ORDERS_READ_ANY)
    }

    pub fn can_view(&self, order: &Order) -> bool {
        order.is_owned_by(self.user_id) || self.is_elevated()
    }
}
