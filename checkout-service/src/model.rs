use std::fmt;

use common_money::Money;
use serde::{Deserialize, Serialize};

/// Order status as reported by the order service, the record of truth for "paid".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    PendingPayment,
    Paid,
    Completed,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Created => "CREATED",
            OrderStatus::PendingPayment => "PENDING_PAYMENT",
            OrderStatus::Paid => "PAID",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }

    /// Lenient parse: case-insensitive, `-`/space treated as `_`.
    pub fn parse(raw: &str) -> Option<OrderStatus> {
        let normalized = raw.trim().to_ascii_uppercase().replace(&['-', ' '][..], "_");
        match normalized.as_str() {
            "CREATED" | "NEW" => Some(OrderStatus::Created),
            "PENDING_PAYMENT" | "PENDING" | "AWAITING_PAYMENT" => Some(OrderStatus::PendingPayment),
            "PAID" => Some(OrderStatus::Paid),
            "COMPLETED" => Some(OrderStatus::Completed),
            "CANCELLED" | "CANCELED" => Some(OrderStatus::Cancelled),
            "FAILED" => Some(OrderStatus::Failed),
            _ => None,
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Completed)
    }

    /// Closed without payment; the order will not become paid.
    pub fn is_dead(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Failed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub order_id: String,
    pub order_number: String,
    pub status: OrderStatus,
    pub total: Money,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryChannel {
    /// Customer is sent to a provider page; completion arrives out of band.
    Redirect,
    /// No redirect target; the request id is polled.
    Poll,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Redirect => "redirect",
            DeliveryChannel::Poll => "poll",
        }
    }
}

/// A payment request created for a server-confirmed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequest {
    pub request_id: Option<String>,
    pub order_id: String,
    pub amount: Money,
    pub delivery_channel: DeliveryChannel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pay_url: Option<String>,
}

/// Which signal led to a confirmation check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationSource {
    PaymentPoll,
    OrderPoll,
    Broadcast,
    Manual,
    /// Offline payment method; the created order itself is the confirmation.
    Offline,
}

impl ConfirmationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfirmationSource::PaymentPoll => "payment_poll",
            ConfirmationSource::OrderPoll => "order_poll",
            ConfirmationSource::Broadcast => "broadcast",
            ConfirmationSource::Manual => "manual",
            ConfirmationSource::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub confirmed: bool,
    pub source: ConfirmationSource,
    /// Last order observation; `None` when every lookup failed.
    pub order: Option<Order>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_server_vocabulary() {
        assert_eq!(OrderStatus::parse("pending_payment"), Some(OrderStatus::PendingPayment));
        assert_eq!(OrderStatus::parse(" Paid "), Some(OrderStatus::Paid));
        assert_eq!(OrderStatus::parse("canceled"), Some(OrderStatus::Cancelled));
        assert_eq!(OrderStatus::parse("shipped"), None);
    }

    #[test]
    fn only_paid_and_completed_count_as_paid() {
        let paid: Vec<_> = [
            OrderStatus::Created,
            OrderStatus::PendingPayment,
            OrderStatus::Paid,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ]
        .into_iter()
        .filter(OrderStatus::is_paid)
        .collect();
        assert_eq!(paid, vec![OrderStatus::Paid, OrderStatus::Completed]);
    }
}
