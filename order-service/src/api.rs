use axum::{
    async_trait,
    extract::{rejection::JsonRejection, FromRequestParts, Path, Query, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use inventory_service::{InventoryRecord, LedgerError, StockUpdate};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared::*;
use std::sync::Arc;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::handlers::OrderService;

pub const USER_ID_HEADER: &str = "x-user-id";
pub const PERMISSIONS_HEADER: &str = "x-user-permissions";

#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<OrderService>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    fn status_and_kind(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            ApiError::Order(e) => {
                let status = match e {
                    OrderError::Validation(_) | OrderError::InvalidVariant(_) => StatusCode::BAD_REQUEST,
                    OrderError::InsufficientStock { .. }
                    | OrderError::InvalidTransition { .. }
                    | OrderError::ReservationPending(_) => StatusCode::CONFLICT,
                    OrderError::Forbidden => StatusCode::FORBIDDEN,
                    OrderError::NotFound { .. } => StatusCode::NOT_FOUND,
                    OrderError::ReservationFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
                    OrderError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.kind())
            }
            ApiError::Ledger(e) => match e {
                LedgerError::NotTracked(_) | LedgerError::UnknownVariant(_) => (StatusCode::NOT_FOUND, "not_found"),
                LedgerError::Insufficient { .. } => (StatusCode::CONFLICT, "insufficient_stock"),
                LedgerError::QuantityBelowReserved { .. } => (StatusCode::CONFLICT, "quantity_below_reserved"),
                LedgerError::ReservationClosed { .. } => (StatusCode::CONFLICT, "reservation_closed"),
                LedgerError::InvalidAmount(_) | LedgerError::EmptyUpdate(_) => {
                    (StatusCode::BAD_REQUEST, "validation_error")
                }
                LedgerError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
        }
    }

    fn details(&self) -> serde_json::Value {
        match self {
            ApiError::Order(OrderError::InsufficientStock {
                variant_id,
                available,
                requested,
            })
            | ApiError::Ledger(LedgerError::Insufficient {
                variant_id,
                available,
                requested,
            }) => json!({
                "variant_id": variant_id,
                "available": available,
                "requested": requested,
            }),
            ApiError::Order(OrderError::InvalidVariant(variant_id))
            | ApiError::Ledger(LedgerError::UnknownVariant(variant_id)) => json!({ "variant_id": variant_id }),
            ApiError::Order(OrderError::ReservationPending(order_id)) => json!({ "order_id": order_id }),
            ApiError::Order(OrderError::InvalidTransition { from, to }) => json!({ "from": from, "to": to }),
            ApiError::Order(OrderError::ReservationFailed { order_id, variant_id, .. }) => {
                json!({ "order_id": order_id, "variant_id": variant_id })
            }
            ApiError::Ledger(LedgerError::QuantityBelowReserved {
                variant_id,
                quantity,
                reserved,
            }) => json!({
                "variant_id": variant_id,
                "quantity": quantity,
                "reserved": reserved,
            }),
            _ => json!({}),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = self.status_and_kind();
        // Infrastructure faults are logged in full but not echoed to the caller.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self);
            "internal storage error".to_string()
        } else {
            self.to_string()
        };

        let body = json!({
            "error": message,
            "kind": kind,
            "details": self.details(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

/// Caller identity taken from the gateway headers.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

impl Authenticated {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, ApiError> {
        let user_id = headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| ApiError::Unauthorized("missing user identity".to_string()))?
            .to_str()
            .ok()
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .ok_or_else(|| ApiError::Unauthorized("malformed user identity".to_string()))?;

        let permissions = headers
            .get(PERMISSIONS_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        Ok(Authenticated(Principal::with_permissions(user_id, permissions)))
    }

    fn require(&self, permission: &str) -> Result<(), ApiError> {
        if self.0.has_permission(permission) {
            Ok(())
        } else {
            Err(OrderError::Forbidden.into())
        }
    }
}

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Authenticated::from_headers(&parts.headers)
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InventoryQuery {
    pub variant_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct InventoryUpdateRequest {
    pub variant_id: Uuid,
    pub quantity: Option<i32>,
    pub low_stock_threshold: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct InventoryView {
    #[serde(flatten)]
    pub record: InventoryRecord,
    pub available: i32,
    pub low_stock: bool,
}

impl From<InventoryRecord> for InventoryView {
    fn from(record: InventoryRecord) -> Self {
        Self {
            available: record.available(),
            low_stock: record.is_low_stock(),
            record,
        }
    }
}

pub fn create_router(state: AppState, cors: CorsLayer) -> Router {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", put(update_order_status))
        .route("/inventory", get(list_inventory).put(update_inventory))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(cors)
}

pub async fn create_order(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    payload: Result<Json<PlaceOrder>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let Json(request) = payload?;
    let order = state.orders.create_order(principal.user_id, request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "order": order }))))
}

pub async fn list_orders(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
) -> Result<Json<serde_json::Value>, ApiError> {
    let orders = state.orders.get_orders(&principal).await?;
    Ok(Json(json!({ "orders": orders })))
}

pub async fn get_order(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(order_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let order = state.orders.get_order(&principal, order_id).await?;
    Ok(Json(json!({ "order": order })))
}

pub async fn update_order_status(
    State(state): State<AppState>,
    caller: Authenticated,
    Path(order_id): Path<Uuid>,
    payload: Result<Json<StatusUpdateRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require(permissions::ORDERS_MANAGE)?;
    let Json(request) = payload?;
    let status = request.status.parse::<OrderStatus>()?;

    let order = state.orders.set_order_status(order_id, status, request.notes).await?;
    info!(%order_id, status = %order.status, by = %caller.0.user_id, "Status updated via API");
    Ok(Json(json!({ "order": order })))
}

pub async fn list_inventory(
    State(state): State<AppState>,
    Authenticated(_): Authenticated,
    Query(query): Query<InventoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let ledger = state.orders.ledger();
    let records = match query.variant_id {
        Some(variant_id) => ledger.get(variant_id).await?.into_iter().collect(),
        None => ledger.list().await?,
    };
    let inventory: Vec<InventoryView> = records.into_iter().map(InventoryView::from).collect();
    Ok(Json(json!({ "inventory": inventory })))
}

pub async fn update_inventory(
    State(state): State<AppState>,
    caller: Authenticated,
    payload: Result<Json<InventoryUpdateRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, ApiError> {
    caller.require(permissions::INVENTORY_MANAGE)?;
    let Json(request) = payload?;
    let update = StockUpdate {
        quantity: request.quantity,
        low_stock_threshold: request.low_stock_threshold,
    };
    let record = state.orders.ledger().update_stock(request.variant_id, update).await?;

    info!(
        variant_id = %record.variant_id,
        quantity = record.quantity,
        low_stock_threshold = record.low_stock_threshold,
        by = %caller.0.user_id,
        "Inventory updated"
    );
    Ok(Json(json!({ "inventory": InventoryView::from(record) })))
}

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.orders.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ok", "database": "connected" })),
        ),
        Err(e) => {
            error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "disconnected" })),
            )
        }
    }
}
