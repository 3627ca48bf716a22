use bigdecimal::BigDecimal;
use inventory_service::{InventoryLedger, LedgerError};
use shared::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::saga::{ReservationPolicy, ReservationSaga};
use crate::store::{OrderStore, StatusChange};

/// Order placement, query and status management over the catalog, ledger and store.
///
/// A new order is stored as `pending` but stays hidden from queries and frozen against
/// status changes until its reservations settle. It then either goes live or is
/// cancelled with every recorded reservation released.
pub struct OrderService {
    catalog: Arc<dyn Catalog>,
    ledger: Arc<dyn InventoryLedger>,
    store: Arc<dyn OrderStore>,
    policy: ReservationPolicy,
}

impl OrderService {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        ledger: Arc<dyn InventoryLedger>,
        store: Arc<dyn OrderStore>,
        policy: ReservationPolicy,
    ) -> Self {
        Self {
            catalog,
            ledger,
            store,
            policy,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn InventoryLedger> {
        &self.ledger
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    pub async fn create_order(&self, user_id: Uuid, request: PlaceOrder) -> Result<Order, OrderError> {
        let draft = self.assemble(user_id, request).await?;
        let store = self.store.as_ref();

        let order_number = self
            .policy
            .retry("Order number", StorageError::is_transient, move || store.next_order_number())
            .await?;
        let order = draft.into_order(order_number);
        let order_id = order.id;

        // Insert is idempotent on the order id, so a timeout after commit is safe to retry.
        let inserted = self
            .policy
            .retry("Order insert", StorageError::is_transient, move || store.insert(order.clone()))
            .await;
        let order = match inserted {
            Ok(order) => order,
            Err(e) => {
                // The insert may still have committed. Such an order must never go live.
                self.settle_as_cancelled(order_id, CancelReason::ReservationFailed).await;
                return Err(e.into());
            }
        };

        let mut saga = ReservationSaga::new(self.ledger.as_ref(), &self.policy, order_id);
        if let Err(failure) = saga.reserve_all(&order.items).await {
            // Cancel first so the order never looks live with partial reservations.
            self.settle_as_cancelled(order_id, failure.cancel_reason()).await;
            saga.compensate().await.ok();
            return Err(failure.into_order_error(order_id));
        }

        let settled = self
            .policy
            .retry("Order settlement", StorageError::is_transient, move || {
                store.settle_reservation(order_id, None)
            })
            .await;
        match settled {
            Ok(Some(order)) => {
                info!(
                    %order_id,
                    order_number = %order.order_number,
                    %user_id,
                    total = %order.total,
                    lines = saga.reserved_lines(),
                    "Order created"
                );
                Ok(order)
            }
            Ok(None) => {
                error!(%order_id, "Order left the reserving state while its stock was being reserved");
                saga.compensate().await.ok();
                Err(StorageError::Corrupt(format!("order {} changed while reserving stock", order_id)).into())
            }
            Err(e) => {
                self.settle_as_cancelled(order_id, CancelReason::ReservationFailed).await;
                saga.compensate().await.ok();
                Err(e.into())
            }
        }
    }

    /// Read-only validation of a request. Nothing is written here.
    async fn assemble(&self, user_id: Uuid, request: PlaceOrder) -> Result<OrderDraft, OrderError> {
        if request.items.is_empty() {
            return Err(OrderError::Validation("Order items are required".to_string()));
        }
        let address_id = request
            .address_id
            .ok_or_else(|| OrderError::Validation("Shipping address is required".to_string()))?;
        if let Some(item) = request.items.iter().find(|item| item.quantity < 1) {
            return Err(OrderError::Validation(format!(
                "Quantity for variant {} must be at least 1",
                item.variant_id
            )));
        }
        let shipping_cost = optional_money("shipping_cost", request.shipping_cost)?;
        let tax = optional_money("tax", request.tax)?;

        let mut claimed: HashMap<Uuid, i32> = HashMap::new();
        let mut lines = Vec::with_capacity(request.items.len());

        for item in &request.items {
            let variant = match self.catalog.get_variant(item.variant_id).await? {
                Some(variant) if variant.is_active => variant,
                _ => return Err(OrderError::InvalidVariant(item.variant_id)),
            };

            let already_claimed = claimed.entry(item.variant_id).or_insert(0);
            let available = self
                .ledger
                .available(item.variant_id)
                .await
                .map_err(ledger_read_error)?
                - *already_claimed;
            if available < item.quantity {
                return Err(OrderError::InsufficientStock {
                    variant_id: item.variant_id,
                    available: available.max(0),
                    requested: item.quantity,
                });
            }
            *already_claimed += item.quantity;

            let product_name = match self.catalog.get_product(variant.product_id).await? {
                Some(product) => product.name,
                None => {
                    warn!(variant_id = %variant.id, product_id = %variant.product_id, "Variant has no product");
                    String::new()
                }
            };

            lines.push(LineItem {
                variant_id: variant.id,
                product_name,
                unit_price: variant.price,
                quantity: item.quantity,
                variant_attributes: variant.attributes,
            });
        }

        let draft = OrderDraft::new(user_id, address_id, lines, shipping_cost, tax);
        draft.check_limits()?;
        Ok(draft)
    }

    /// Ends the reservation phase of an order by cancelling it. A missing or already
    /// settled order is left alone.
    async fn settle_as_cancelled(&self, order_id: Uuid, reason: CancelReason) {
        let store = self.store.as_ref();
        let settled = self
            .policy
            .retry("Order cancellation", StorageError::is_transient, move || {
                store.settle_reservation(order_id, Some(reason))
            })
            .await;
        match settled {
            Ok(Some(_)) => warn!(
                %order_id,
                reason = reason.as_str(),
                "Order cancelled after failed reservation"
            ),
            Ok(None) => info!(%order_id, "No reserving order to cancel"),
            Err(e) => error!(
                %order_id,
                "Data integrity: order stuck in reservation after failure: {}", e
            ),
        }
    }

    pub async fn get_orders(&self, principal: &Principal) -> Result<Vec<Order>, OrderError> {
        let owner = if principal.is_elevated() {
            None
        } else {
            Some(principal.user_id)
        };
        Ok(self.store.list(owner).await?)
    }

    pub async fn get_order(&self, principal: &Principal, order_id: Uuid) -> Result<Order, OrderError> {
        let order = self
            .store
            .find(order_id)
            .await?
            .filter(|order| !order.reserving)
            .ok_or_else(|| OrderError::order_not_found(order_id))?;

        if !principal.can_view(&order) {
            return Err(OrderError::Forbidden);
        }
        Ok(order)
    }

    /// Moves an order along the status table, applying the matching inventory effect.
    pub async fn set_order_status(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        notes: Option<String>,
    ) -> Result<Order, OrderError> {
        loop {
            let current = self
                .store
                .find(order_id)
                .await?
                .ok_or_else(|| OrderError::order_not_found(order_id))?;
            if current.reserving {
                return Err(OrderError::ReservationPending(order_id));
            }
            current.status.transition(next)?;

            let change = StatusChange {
                status: next,
                cancel_reason: (next == OrderStatus::Cancelled).then_some(CancelReason::Requested),
                notes: notes.clone(),
            };

            // A lost compare-and-set means someone else moved the order; re-validate.
            let Some(updated) = self.store.update_status(order_id, current.status, change).await? else {
                continue;
            };

            info!(%order_id, from = %current.status, to = %next, "Order status changed");
            self.apply_stock_effect(&updated, next).await;
            return Ok(updated);
        }
    }

    /// Only reservations the ledger recorded for the order are touched.
    async fn apply_stock_effect(&self, order: &Order, next: OrderStatus) {
        let ledger = self.ledger.as_ref();
        let order_id = order.id;
        let result = match next {
            OrderStatus::Cancelled | OrderStatus::Refunded => {
                self.policy
                    .retry("Release", LedgerError::is_transient, move || ledger.release_order(order_id))
                    .await
            }
            OrderStatus::Shipped => {
                self.policy
                    .retry("Fulfilment", LedgerError::is_transient, move || ledger.fulfil_order(order_id))
                    .await
            }
            _ => return,
        };

        match result {
            Ok(lines) => info!(%order_id, status = %next, lines = lines.len(), "Inventory updated after status change"),
            Err(e) => error!(
                %order_id,
                status = %next,
                "Data integrity: inventory not updated after status change: {}", e
            ),
        }
    }
}

fn optional_money(field: &str, value: Option<BigDecimal>) -> Result<BigDecimal, OrderError> {
    match value {
        Some(value) => validate_money(field, &value),
        None => Ok(BigDecimal::from(0).with_scale(MONEY_SCALE)),
    }
}

fn ledger_read_error(e: LedgerError) -> OrderError {
    match e {
        LedgerError::Storage(storage) => OrderError::Storage(storage),
        other => OrderError::Validation(other.to_string()),
    }
}
