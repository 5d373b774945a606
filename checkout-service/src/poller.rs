use std::sync::Arc;
use std::time::Duration;

use common_observability::CheckoutMetrics;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::attempt::{AttemptToken, Cancelled};
use crate::codec::{decode_order_status, decode_payment_status, PaymentOutcome};
use crate::model::ConfirmationSource;
use crate::order_client::OrderService;
use crate::payment_client::PaymentService;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self { interval: Duration::from_secs(3), timeout: Duration::from_secs(120) }
    }
}

impl PollSettings {
    /// Number of ticks that fit in the timeout; at least one.
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        (self.timeout.as_millis() / interval).clamp(1, u32::MAX as u128) as u32
    }
}

/// What a poll loop settled on. `Pending` means the window closed without a
/// decisive answer; the order is left awaiting confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciliationAttempt {
    pub outcome: PaymentOutcome,
    pub source: ConfirmationSource,
    pub attempts: u32,
}

#[derive(Clone)]
pub struct PaymentStatusPoller {
    orders: Arc<dyn OrderService>,
    payments: Arc<dyn PaymentService>,
    metrics: Arc<CheckoutMetrics>,
}

impl PaymentStatusPoller {
    pub fn new(
        orders: Arc<dyn OrderService>,
        payments: Arc<dyn PaymentService>,
        metrics: Arc<CheckoutMetrics>,
    ) -> Self {
        Self { orders, payments, metrics }
    }

    /// Poll `request_id` once per interval until a decisive outcome or until the
    /// timeout budget is spent. `on_progress` receives the 1-based attempt number
    /// before each check.
    pub async fn poll<F>(
        &self,
        request_id: &str,
        order_id: Option<&str>,
        settings: PollSettings,
        token: &AttemptToken,
        mut on_progress: F,
    ) -> Result<ReconciliationAttempt, Cancelled>
    where
        F: FnMut(u32) + Send,
    {
        let start = Instant::now();
        let deadline = start + settings.timeout;
        let max_attempts = settings.max_attempts();
        let mut ticker = interval_at(start + settings.interval, settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut attempts = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Cancelled),
                _ = ticker.tick() => {}
            }
            attempts += 1;
            on_progress(attempts);

            let (outcome, source) = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Cancelled),
                checked = self.check_once(Some(request_id), order_id) => checked,
            };
            if outcome.is_decisive() {
                debug!(request_id, attempts, outcome = outcome.as_str(), "poll settled");
                return Ok(ReconciliationAttempt { outcome, source, attempts });
            }
            if attempts >= max_attempts || Instant::now() >= deadline {
                debug!(request_id, attempts, "poll window closed without a decisive outcome");
                return Ok(ReconciliationAttempt {
                    outcome: PaymentOutcome::Pending,
                    source: ConfirmationSource::PaymentPoll,
                    attempts,
                });
            }
        }
    }

    /// One immediate check: payment status first, then the order as
    /// corroboration when the payment side is undecided.
    pub async fn check_once(
        &self,
        request_id: Option<&str>,
        order_id: Option<&str>,
    ) -> (PaymentOutcome, ConfirmationSource) {
        let mut outcome = PaymentOutcome::Unknown;
        if let Some(request_id) = request_id {
            self.metrics.record_poll_attempt("payment");
            outcome = match self.payments.get_payment_status(request_id).await {
                Ok(payload) => decode_payment_status(&payload),
                Err(e) => {
                    warn!(request_id, error = %e, "payment status check failed; will retry");
                    self.metrics.record_collaborator_error("payment-service", "get_payment_status");
                    PaymentOutcome::Unknown
                }
            };
            if outcome.is_decisive() {
                return (outcome, ConfirmationSource::PaymentPoll);
            }
        }
        if let Some(order_id) = order_id {
            self.metrics.record_poll_attempt("order");
            match self.orders.get_order(order_id).await {
                Ok(order) => {
                    let from_order = decode_order_status(order.status);
                    if from_order.is_decisive() {
                        return (from_order, ConfirmationSource::OrderPoll);
                    }
                    if outcome == PaymentOutcome::Unknown {
                        outcome = from_order;
                    }
                }
                Err(e) => {
                    warn!(order_id, error = %e, "order status check failed; will retry");
                    self.metrics.record_collaborator_error("order-service", "get_order");
                }
            }
        }
        (outcome, ConfirmationSource::PaymentPoll)
    }
}
