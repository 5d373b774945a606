use thiserror::Error;

use crate::draft::DraftErrors;
use crate::model::OrderStatus;

/// Failure talking to an order, payment, or cart collaborator.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("http_error: {0}")]
    Http(String),
    #[error("{service} returned status {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },
    #[error("invalid response from {service}: {message}")]
    Decode {
        service: &'static str,
        message: String,
    },
    #[error("{0} not found")]
    NotFound(String),
}

impl From<reqwest::Error> for ServiceError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors surfaced by the checkout state controller to its caller.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Validation(#[from] DraftErrors),
    #[error("failed to read cart: {0}")]
    Cart(#[source] ServiceError),
    #[error("failed to create order: {0}")]
    CreateOrder(#[source] ServiceError),
    #[error("order {order_id} was created with status {status}")]
    OrderRejected { order_id: String, status: OrderStatus },
    #[error("failed to create payment request for order {order_id}: {source}")]
    CreatePayment {
        order_id: String,
        #[source]
        source: ServiceError,
    },
    #[error("provider returned neither a redirect target nor a pollable identifier")]
    NoPaymentTarget { order_id: String },
    #[error("checkout attempt was superseded or cancelled")]
    Superseded,
    #[error("no checkout attempt is waiting for payment confirmation")]
    NotWaiting,
}

impl CheckoutError {
    /// Creation failures leave nothing behind and may be retried with a fresh attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CheckoutError::Cart(_)
                | CheckoutError::CreateOrder(_)
                | CheckoutError::CreatePayment { .. }
                | CheckoutError::NoPaymentTarget { .. }
        )
    }

    /// Text suitable for showing to the shopper.
    pub fn user_message(&self) -> String {
        match self {
            CheckoutError::Validation(errs) => {
                format!("Please correct {} field(s) and try again.", errs.len())
            }
            CheckoutError::Cart(_) => "We could not read your cart. Please try again.".into(),
            CheckoutError::CreateOrder(_) | CheckoutError::OrderRejected { .. } => {
                "We could not place your order. Please try again.".into()
            }
            CheckoutError::CreatePayment { .. } | CheckoutError::NoPaymentTarget { .. } => {
                "We could not start the payment. Please try checking out again.".into()
            }
            CheckoutError::Superseded => "This checkout was replaced by a newer one.".into(),
            CheckoutError::NotWaiting => "There is no payment waiting for confirmation.".into(),
        }
    }
}
