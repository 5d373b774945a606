use std::sync::Arc;

use tracing::{info, warn};

use crate::attempt::AttemptId;
use crate::draft::OrderDraft;
use crate::error::CheckoutError;
use crate::model::{DeliveryChannel, Order, PaymentRequest};
use crate::order_client::OrderService;
use crate::payment_client::{CreatePaymentRequest, PaymentReceipt, PaymentService};

/// Cents of drift tolerated between the client subtotal and the server total
/// before it is worth logging.
const TOTAL_DRIFT_CENTS: i64 = 1;

/// Result of the creation phases of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Initiated {
    /// Cash on delivery; nothing to pay online.
    Offline(Order),
    Online { order: Order, request: PaymentRequest },
}

/// Turns a draft into a server-side order, and an order into a payment request
/// with a known delivery channel. Both calls are keyed by the attempt so a
/// transport retry inside one attempt never creates a second order or charge.
#[derive(Clone)]
pub struct PaymentRequestInitiator {
    orders: Arc<dyn OrderService>,
    payments: Arc<dyn PaymentService>,
}

impl PaymentRequestInitiator {
    pub fn new(orders: Arc<dyn OrderService>, payments: Arc<dyn PaymentService>) -> Self {
        Self { orders, payments }
    }

    pub async fn create_order(&self, draft: &OrderDraft, attempt: AttemptId) -> Result<Order, CheckoutError> {
        let order = self
            .orders
            .create_order(draft, &attempt.to_string())
            .await
            .map_err(CheckoutError::CreateOrder)?;
        if order.status.is_dead() {
            warn!(order_id = %order.order_id, status = %order.status, "order created in a dead status");
            return Err(CheckoutError::OrderRejected { order_id: order.order_id, status: order.status });
        }
        if !order.total.nearly_equals(&draft.client_subtotal, TOTAL_DRIFT_CENTS) {
            info!(
                order_id = %order.order_id,
                client_subtotal = %draft.client_subtotal,
                server_total = %order.total,
                "server total differs from client subtotal; charging server total"
            );
        }
        Ok(order)
    }

    /// The amount charged is always the order's server-side total.
    pub async fn create_payment(&self, order: &Order, attempt: AttemptId) -> Result<PaymentRequest, CheckoutError> {
        let req = CreatePaymentRequest { order_id: order.order_id.clone(), amount: order.total.clone() };
        let receipt = self
            .payments
            .create_payment_request(&req, &attempt.payment_key())
            .await
            .map_err(|source| CheckoutError::CreatePayment { order_id: order.order_id.clone(), source })?;
        classify(order, receipt)
    }

    /// Both creation phases in order. `on_order` runs between them and can stop
    /// the attempt before a payment request is made.
    pub async fn initiate<F>(&self, draft: &OrderDraft, attempt: AttemptId, on_order: F) -> Result<Initiated, CheckoutError>
    where
        F: FnOnce(&Order) -> Result<(), CheckoutError> + Send,
    {
        let order = self.create_order(draft, attempt).await?;
        if draft.payment_method.is_offline() {
            return Ok(Initiated::Offline(order));
        }
        on_order(&order)?;
        let request = self.create_payment(&order, attempt).await?;
        Ok(Initiated::Online { order, request })
    }
}

/// A pay URL means the shopper is sent to the provider; otherwise a request id
/// means the status can be polled. Neither is a creation failure.
pub fn classify(order: &Order, receipt: PaymentReceipt) -> Result<PaymentRequest, CheckoutError> {
    let pay_url = receipt.pay_url.filter(|u| !u.trim().is_empty());
    let request_id = receipt.request_id.filter(|id| !id.trim().is_empty());
    let delivery_channel = match (&pay_url, &request_id) {
        (Some(_), _) => DeliveryChannel::Redirect,
        (None, Some(_)) => DeliveryChannel::Poll,
        (None, None) => {
            return Err(CheckoutError::NoPaymentTarget { order_id: order.order_id.clone() });
        }
    };
    Ok(PaymentRequest {
        request_id,
        order_id: order.order_id.clone(),
        amount: order.total.clone(),
        delivery_channel,
        pay_url,
    })
}
