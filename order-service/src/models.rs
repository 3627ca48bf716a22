use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use shared::*;
use uuid::Uuid;

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::products)]
pub struct DbProduct {
    pub id: Uuid,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::product_variants)]
pub struct DbVariant {
    pub id: Uuid,
    pub product_id: Uuid,
    pub sku: String,
    pub price: BigDecimal,
    pub attributes: serde_json::Value,
    pub is_active: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::orders)]
pub struct DbOrder {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub status: String,
    pub subtotal: BigDecimal,
    pub shipping_cost: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
    pub cancel_reason: Option<String>,
    pub notes: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub reserving: bool,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::orders)]
pub struct NewOrder {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub address_id: Uuid,
    pub status: String,
    pub subtotal: BigDecimal,
    pub shipping_cost: BigDecimal,
    pub tax: BigDecimal,
    pub total: BigDecimal,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub reserving: bool,
}

#[derive(Debug, Clone, Queryable, Insertable, Serialize, Deserialize)]
#[diesel(table_name = crate::schema::order_items)]
pub struct DbOrderItem {
    pub id: Uuid,
    pub order_id: Uuid,
    pub position: i32,
    pub variant_id: Uuid,
    pub product_name: String,
    pub unit_price: BigDecimal,
    pub quantity: i32,
    pub variant_attributes: serde_json::Value,
}

/// Only the mutable columns of an order. `None` leaves a column untouched.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::orders)]
pub struct OrderStatusChange {
    pub status: String,
    pub cancel_reason: Option<String>,
    pub notes: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Ends the reservation phase of an order, optionally cancelling it at the same time.
#[derive(Debug, Clone, AsChangeset)]
#[diesel(table_name = crate::schema::orders)]
pub struct ReservationSettlement {
    pub reserving: bool,
    pub status: Option<String>,
    pub cancel_reason: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl From<&Order> for NewOrder {
    fn from(order: &Order) -> Self {
        Self {
            id: order.id,
            order_number: order.order_number.clone(),
            user_id: order.user_id,
            address_id: order.address_id,
            status: order.status.as_str().to_string(),
            subtotal: order.subtotal.clone(),
            shipping_cost: order.shipping_cost.clone(),
            tax: order.tax.clone(),
            total: order.total.clone(),
            created_at: Some(order.created_at),
            updated_at: Some(order.updated_at),
            reserving: order.reserving,
        }
    }
}

impl DbOrderItem {
    pub fn rows_for(order: &Order) -> Result<Vec<DbOrderItem>, StorageError> {
        order
            .items
            .iter()
            .enumerate()
            .map(|(position, item)| {
                Ok(DbOrderItem {
                    id: Uuid::new_v4(),
                    order_id: order.id,
                    position: position as i32,
                    variant_id: item.variant_id,
                    product_name: item.product_name.clone(),
                    unit_price: item.unit_price.clone(),
                    quantity: item.quantity,
                    variant_attributes: serde_json::to_value(&item.variant_attributes)?,
                })
            })
            .collect()
    }

    fn into_line_item(self) -> Result<LineItem, StorageError> {
        Ok(LineItem {
            variant_id: self.variant_id,
            product_name: self.product_name,
            unit_price: self.unit_price,
            quantity: self.quantity,
            variant_attributes: serde_json::from_value(self.variant_attributes)?,
        })
    }
}

impl DbOrder {
    /// Rebuilds the domain order. `items` must already be sorted by position.
    pub fn into_order(self, items: Vec<DbOrderItem>) -> Result<Order, StorageError> {
        let status = self
            .status
            .parse::<OrderStatus>()
            .map_err(|e| StorageError::Corrupt(format!("order {}: {}", self.id, e)))?;
        let cancel_reason = self
            .cancel_reason
            .as_deref()
            .map(str::parse::<CancelReason>)
            .transpose()
            .map_err(|e| StorageError::Corrupt(format!("order {}: {}", self.id, e)))?;
        let items = items
            .into_iter()
            .map(DbOrderItem::into_line_item)
            .collect::<Result<Vec<_>, _>>()?;
        let created_at = self.created_at.unwrap_or_else(Utc::now);

        Ok(Order {
            id: self.id,
            order_number: self.order_number,
            user_id: self.user_id,
            address_id: self.address_id,
            items,
            subtotal: self.subtotal,
            shipping_cost: self.shipping_cost,
            tax: self.tax,
            total: self.total,
            status,
            cancel_reason,
            notes: self.notes,
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
            reserving: self.reserving,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_traits::Zero;

    fn sample_order() -> Order {
        let (attributes, _) = attributes_from_json(&serde_json::json!({"color": "blue", "ruled": true}));
        let item = LineItem {
            variant_id: Uuid::new_v4(),
            product_name: "Fountain pen".to_string(),
            unit_price: BigDecimal::from(12),
            quantity: 2,
            variant_attributes: attributes,
        };
        OrderDraft::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![item],
            BigDecimal::zero(),
            BigDecimal::zero(),
        )
        .into_order("ORD-1-000001".to_string())
    }

    #[test]
    fn order_rows_rebuild_the_same_order() {
        let order = sample_order();
        let new_row = NewOrder::from(&order);
        let items = DbOrderItem::rows_for(&order).unwrap();

        let stored = DbOrder {
            id: new_row.id,
            order_number: new_row.order_number,
            user_id: new_row.user_id,
            address_id: new_row.address_id,
            status: new_row.status,
            subtotal: new_row.subtotal,
            shipping_cost: new_row.shipping_cost,
            tax: new_row.tax,
            total: new_row.total,
            cancel_reason: None,
            notes: None,
            created_at: new_row.created_at,
            updated_at: new_row.updated_at,
            reserving: new_row.reserving,
        };

        assert_eq!(stored.into_order(items).unwrap(), order);
    }

    #[test]
    fn unknown_status_is_reported_as_corruption() {
        let order = sample_order();
        let new_row = NewOrder::from(&order);
        let stored = DbOrder {
            id: new_row.id,
            order_number: new_row.order_number,
            user_id: new_row.user_id,
            address_id: new_row.address_id,
            status: "lost".to_string(),
            subtotal: new_row.subtotal,
            shipping_cost: new_row.shipping_cost,
            tax: new_row.tax,
            total: new_row.total,
            cancel_reason: None,
            notes: None,
            created_at: None,
            updated_at: None,
            reserving: false,
        };

        assert!(matches!(stored.into_order(vec![]), Err(StorageError::Corrupt(_))));
    }
}
