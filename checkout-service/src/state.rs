use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::attempt::AttemptId;
use crate::error::CheckoutError;
use crate::model::{ConfirmationSource, DeliveryChannel, Order};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    CreateOrder,
    OrderRejected,
    CreatePayment,
    NoPaymentTarget,
    PaymentDeclined,
    Cancelled,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::CreateOrder => "create_order",
            FailureReason::OrderRejected => "order_rejected",
            FailureReason::CreatePayment => "create_payment",
            FailureReason::NoPaymentTarget => "no_payment_target",
            FailureReason::PaymentDeclined => "payment_declined",
            FailureReason::Cancelled => "cancelled",
        }
    }

    pub fn from_error(err: &CheckoutError) -> Self {
        match err {
            CheckoutError::OrderRejected { .. } => FailureReason::OrderRejected,
            CheckoutError::CreatePayment { .. } => FailureReason::CreatePayment,
            CheckoutError::NoPaymentTarget { .. } => FailureReason::NoPaymentTarget,
            CheckoutError::Superseded => FailureReason::Cancelled,
            _ => FailureReason::CreateOrder,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutReason {
    /// No decisive answer inside the window. The order may still be paid later.
    AwaitingConfirmation,
    /// The provider reported success but the order never showed it.
    ReconciliationMismatch,
}

impl TimeoutReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutReason::AwaitingConfirmation => "awaiting_confirmation",
            TimeoutReason::ReconciliationMismatch => "reconciliation_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CheckoutState {
    Idle,
    CreatingOrder,
    #[serde(rename_all = "camelCase")]
    CreatingPayment { order_id: String },
    #[serde(rename_all = "camelCase")]
    Waiting {
        channel: DeliveryChannel,
        order_id: String,
        request_id: Option<String>,
        pay_url: Option<String>,
    },
    Confirmed { order: Order, source: ConfirmationSource },
    Failed { reason: FailureReason, message: String },
    #[serde(rename_all = "camelCase")]
    Timeout { reason: TimeoutReason, order_id: String },
}

impl CheckoutState {
    pub fn name(&self) -> &'static str {
        match self {
            CheckoutState::Idle => "IDLE",
            CheckoutState::CreatingOrder => "CREATING_ORDER",
            CheckoutState::CreatingPayment { .. } => "CREATING_PAYMENT",
            CheckoutState::Waiting { .. } => "WAITING",
            CheckoutState::Confirmed { .. } => "CONFIRMED",
            CheckoutState::Failed { .. } => "FAILED",
            CheckoutState::Timeout { .. } => "TIMEOUT",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckoutState::Confirmed { .. } | CheckoutState::Failed { .. } | CheckoutState::Timeout { .. }
        )
    }

    /// An attempt is in flight: creating resources or waiting for payment.
    pub fn is_active(&self) -> bool {
        !self.is_terminal() && *self != CheckoutState::Idle
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    CreatingOrder,
    CreatingPayment,
    Redirect,
    Polling,
    Reconciling,
    Confirmed,
    Failed,
    Timeout,
    Cancelled,
}

/// One entry on the progress stream. Carries enough to tell the shopper which
/// channel is being waited on and how many checks have run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub attempt: Uuid,
    pub status: ProgressStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<DeliveryChannel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_count: Option<u32>,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(attempt: AttemptId, status: ProgressStatus, message: impl Into<String>) -> Self {
        Self {
            attempt: attempt.as_uuid(),
            status,
            message: message.into(),
            channel: None,
            attempt_count: None,
            at: Utc::now(),
        }
    }

    pub fn on_channel(mut self, channel: DeliveryChannel) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.attempt_count = Some(count);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutSnapshot {
    pub attempt_id: Option<Uuid>,
    #[serde(flatten)]
    pub state: CheckoutState,
    pub last_event: Option<ProgressEvent>,
}
