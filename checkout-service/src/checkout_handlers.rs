use axum::extract::{Query, State};
use axum::{http::HeaderMap, Json};
use common_http_errors::{ApiError, ApiResult};
use common_money::Money;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::broadcast::{CompletionSignal, Delivery};
use crate::draft::{CartLine, CheckoutForm};
use crate::error::CheckoutError;
use crate::order_client::IDEMPOTENCY_HEADER;
use crate::state::CheckoutSnapshot;

pub fn checkout_error(err: CheckoutError) -> ApiError {
    let message = err.user_message();
    match err {
        CheckoutError::Validation(errors) => ApiError::Unprocessable {
            code: "invalid_draft",
            fields: errors.fields,
            trace_id: None,
        },
        CheckoutError::Cart(_) => ApiError::bad_gateway("cart_unavailable", message),
        CheckoutError::CreateOrder(_) => ApiError::bad_gateway("create_order_failed", message),
        CheckoutError::CreatePayment { .. } => ApiError::bad_gateway("create_payment_failed", message),
        CheckoutError::NoPaymentTarget { .. } => ApiError::bad_gateway("no_payment_target", message),
        CheckoutError::OrderRejected { .. } => ApiError::conflict("order_rejected", message),
        CheckoutError::Superseded => ApiError::conflict("attempt_superseded", message),
        CheckoutError::NotWaiting => ApiError::conflict("not_waiting", message),
    }
}

/// A client-supplied `Idempotency-Key` pins the submission id so a retried POST
/// lands on the attempt already in flight.
fn submission_key(headers: &HeaderMap) -> ApiResult<Option<Uuid>> {
    match headers.get(IDEMPOTENCY_HEADER) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|s| Uuid::parse_str(s.trim()).ok())
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest {
                code: "invalid_idempotency_key",
                trace_id: None,
                message: Some("Idempotency-Key must be a UUID".into()),
            }),
    }
}

pub async fn submit_checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(form): Json<CheckoutForm>,
) -> ApiResult<Json<CheckoutSnapshot>> {
    let submission = submission_key(&headers)?;
    let lines = state
        .cart
        .read_line_items()
        .await
        .map_err(|e| checkout_error(CheckoutError::Cart(e)))?;
    let mut draft = state
        .draft_builder
        .build(&lines, &form)
        .map_err(|e| checkout_error(e.into()))?;
    if let Some(id) = submission {
        draft.submission_id = id;
    }
    let snapshot = state.controller.submit_checkout(draft).await.map_err(checkout_error)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartBody {
    #[serde(default, alias = "lineItems")]
    pub items: Vec<CartLine>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CartView {
    pub items: Vec<CartLine>,
    pub subtotal: Money,
}

impl From<Vec<CartLine>> for CartView {
    fn from(items: Vec<CartLine>) -> Self {
        let subtotal = items.iter().map(|l| l.unit_price.times(l.quantity)).sum();
        Self { items, subtotal }
    }
}

pub async fn read_cart(State(state): State<AppState>) -> ApiResult<Json<CartView>> {
    let lines = state
        .cart
        .read_line_items()
        .await
        .map_err(|e| checkout_error(CheckoutError::Cart(e)))?;
    Ok(Json(lines.into()))
}

/// Replace the shopper's cart. Lines are validated when a checkout is submitted.
pub async fn replace_cart(State(state): State<AppState>, Json(body): Json<CartBody>) -> ApiResult<Json<CartView>> {
    state
        .cart
        .replace_line_items(body.items.clone())
        .await
        .map_err(|e| checkout_error(CheckoutError::Cart(e)))?;
    Ok(Json(body.items.into()))
}

pub async fn confirm_checkout(State(state): State<AppState>) -> ApiResult<Json<CheckoutSnapshot>> {
    state.controller.confirm_now().map(Json).map_err(checkout_error)
}

pub async fn cancel_checkout(State(state): State<AppState>) -> Json<CheckoutSnapshot> {
    Json(state.controller.cancel())
}

pub async fn checkout_status(State(state): State<AppState>) -> Json<CheckoutSnapshot> {
    Json(state.controller.snapshot())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnParams {
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub result_code: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReturnAck {
    pub delivered: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receivers: Option<usize>,
}

/// Landing page for provider redirects. Announces the result to whichever
/// context is waiting on this order.
pub async fn payment_return(
    State(state): State<AppState>,
    Query(params): Query<ReturnParams>,
) -> ApiResult<Json<ReturnAck>> {
    let order_id = params
        .order_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest {
            code: "missing_order_id",
            trace_id: None,
            message: Some("orderId is required".into()),
        })?;
    let result_code = params.result_code.as_deref().and_then(|c| c.trim().parse::<i64>().ok());
    let signal = CompletionSignal {
        order_id,
        request_id: params.request_id.filter(|s| !s.trim().is_empty()),
        result_code,
    };
    let delivery = state.bus.publish(&signal).map_err(|e| {
        warn!(error = %e, "failed to encode completion signal");
        ApiError::internal(e, None)
    })?;
    info!(order_id = %signal.order_id, result_code = ?signal.result_code, ?delivery, "payment return received");
    Ok(Json(match delivery {
        Delivery::Direct { receivers } => ReturnAck { delivered: "direct", receivers: Some(receivers) },
        Delivery::Relayed => ReturnAck { delivered: "relayed", receivers: None },
    }))
}
