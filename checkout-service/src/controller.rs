use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use common_observability::CheckoutMetrics;
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attempt::{AttemptId, AttemptRegistry, AttemptToken, Cancelled};
use crate::broadcast::{BroadcastBus, CompletionSignal, CrossTabBroadcastListener, SignalChannel};
use crate::cart::CartStore;
use crate::codec::{decode_optional_code, PaymentOutcome};
use crate::draft::OrderDraft;
use crate::error::CheckoutError;
use crate::initiator::{Initiated, PaymentRequestInitiator};
use crate::model::{ConfirmationSource, DeliveryChannel, Order, PaymentRequest};
use crate::order_client::OrderService;
use crate::payment_client::PaymentService;
use crate::poller::{PaymentStatusPoller, PollSettings};
use crate::reconciler::OrderReconciler;
use crate::state::{
    CheckoutSnapshot, CheckoutState, FailureReason, ProgressEvent, ProgressStatus, TimeoutReason,
};

const PROGRESS_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerSettings {
    pub poll: PollSettings,
    pub reconcile_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { poll: PollSettings::default(), reconcile_interval: Duration::from_secs(2) }
    }
}

/// External parties the checkout flow talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub orders: Arc<dyn OrderService>,
    pub payments: Arc<dyn PaymentService>,
    pub cart: Arc<dyn CartStore>,
}

struct Session {
    attempt: Option<AttemptId>,
    submission_id: Option<Uuid>,
    state: CheckoutState,
    last_event: Option<ProgressEvent>,
    manual: Arc<Notify>,
    driver: Option<JoinHandle<()>>,
}

impl Session {
    fn snapshot(&self) -> CheckoutSnapshot {
        CheckoutSnapshot {
            attempt_id: self.attempt.map(|a| a.as_uuid()),
            state: self.state.clone(),
            last_event: self.last_event.clone(),
        }
    }
}

struct Inner {
    initiator: PaymentRequestInitiator,
    poller: PaymentStatusPoller,
    reconciler: OrderReconciler,
    orders: Arc<dyn OrderService>,
    cart: Arc<dyn CartStore>,
    bus: BroadcastBus,
    metrics: Arc<CheckoutMetrics>,
    settings: ControllerSettings,
    registry: AttemptRegistry,
    session: Mutex<Session>,
    progress: broadcast::Sender<ProgressEvent>,
}

enum Step {
    Polled { outcome: PaymentOutcome, source: ConfirmationSource, attempts: u32 },
    Signal(CompletionSignal, SignalChannel),
    Manual,
    Expired,
}

/// Drives one checkout attempt at a time through
/// `IDLE -> CREATING_ORDER -> CREATING_PAYMENT -> WAITING -> CONFIRMED | FAILED | TIMEOUT`.
///
/// Every continuation carries the [`AttemptToken`] it was started with and is
/// dropped once a newer attempt begins or a terminal state is reached. The cart
/// is cleared only by the transition into `CONFIRMED`. One controller serves one
/// shopper's checkout context.
#[derive(Clone)]
pub struct PaymentStateController {
    inner: Arc<Inner>,
}

impl PaymentStateController {
    pub fn new(
        collaborators: Collaborators,
        bus: BroadcastBus,
        metrics: Arc<CheckoutMetrics>,
        settings: ControllerSettings,
    ) -> Self {
        let Collaborators { orders, payments, cart } = collaborators;
        let (progress, _) = broadcast::channel(PROGRESS_CAPACITY);
        let inner = Inner {
            initiator: PaymentRequestInitiator::new(orders.clone(), payments.clone()),
            poller: PaymentStatusPoller::new(orders.clone(), payments, metrics.clone()),
            reconciler: OrderReconciler::new(orders.clone(), settings.reconcile_interval),
            orders,
            cart,
            bus,
            metrics,
            settings,
            registry: AttemptRegistry::new(),
            session: Mutex::new(Session {
                attempt: None,
                submission_id: None,
                state: CheckoutState::Idle,
                last_event: None,
                manual: Arc::new(Notify::new()),
                driver: None,
            }),
            progress,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.inner.progress.subscribe()
    }

    pub fn snapshot(&self) -> CheckoutSnapshot {
        self.inner.session().snapshot()
    }

    /// Start a checkout attempt for `draft`.
    ///
    /// Order and payment creation run on the attempt's own task, so a caller
    /// that goes away mid-request does not strand the attempt. Resolves once the
    /// attempt is waiting for payment (or already terminal). Re-submitting the
    /// draft of the attempt in flight returns its snapshot without touching the
    /// network. Any other submission supersedes the previous attempt.
    pub async fn submit_checkout(&self, draft: OrderDraft) -> Result<CheckoutSnapshot, CheckoutError> {
        let (reply, opened) = oneshot::channel();
        let attempt = {
            let mut session = self.inner.session();
            if session.state.is_active() && session.submission_id == Some(draft.submission_id) {
                debug!(submission = %draft.submission_id, "duplicate submission; keeping current attempt");
                return Ok(session.snapshot());
            }
            if let Some(driver) = session.driver.take() {
                // a terminal driver may still be clearing the cart
                if !session.state.is_terminal() {
                    driver.abort();
                }
            }
            let token = self.inner.registry.begin();
            let manual = Arc::new(Notify::new());
            let event = ProgressEvent::new(token.id(), ProgressStatus::CreatingOrder, "Creating your order");
            session.attempt = Some(token.id());
            session.submission_id = Some(draft.submission_id);
            session.state = CheckoutState::CreatingOrder;
            session.last_event = Some(event.clone());
            session.manual = manual.clone();
            let _ = self.inner.progress.send(event);
            let attempt = token.id();
            session.driver = Some(tokio::spawn(self.inner.clone().run(token, draft, manual, reply)));
            attempt
        };

        match opened.await {
            Ok(result) => result,
            // the attempt task ended without answering: cancelled or superseded
            Err(_) => {
                let session = self.inner.session();
                if session.attempt == Some(attempt) {
                    Ok(session.snapshot())
                } else {
                    Err(CheckoutError::Superseded)
                }
            }
        }
    }

    /// "I have paid": run one immediate check instead of waiting for the next
    /// tick. Success still goes through order reconciliation.
    pub fn confirm_now(&self) -> Result<CheckoutSnapshot, CheckoutError> {
        let session = self.inner.session();
        match session.state {
            CheckoutState::Waiting { .. } => {
                session.manual.notify_one();
                Ok(session.snapshot())
            }
            _ => Err(CheckoutError::NotWaiting),
        }
    }

    /// Abandon the active attempt. The server-side order is left as is.
    pub fn cancel(&self) -> CheckoutSnapshot {
        let mut session = self.inner.session();
        let Some(attempt) = session.attempt else {
            return session.snapshot();
        };
        if !session.state.is_active() {
            return session.snapshot();
        }
        if let Some(driver) = session.driver.take() {
            driver.abort();
        }
        let event = ProgressEvent::new(attempt, ProgressStatus::Cancelled, "Checkout cancelled");
        session.state = CheckoutState::Failed {
            reason: FailureReason::Cancelled,
            message: "Checkout was cancelled.".into(),
        };
        session.last_event = Some(event.clone());
        let snapshot = session.snapshot();
        drop(session);

        self.inner.registry.revoke(attempt);
        self.inner.metrics.record_terminal("FAILED", FailureReason::Cancelled.as_str());
        info!(attempt = %attempt, "checkout attempt cancelled");
        let _ = self.inner.progress.send(event);
        snapshot
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `next` if `token` still owns a non-terminal session. Terminal
    /// states revoke the token so every other continuation of the attempt stops.
    fn transition(&self, token: &AttemptToken, next: CheckoutState, event: ProgressEvent) -> bool {
        let terminal = terminal_labels(&next);
        {
            let mut session = self.session();
            if session.attempt != Some(token.id()) || !token.is_current() || session.state.is_terminal() {
                debug!(attempt = %token.id(), next = next.name(), "dropping stale transition");
                return false;
            }
            debug!(attempt = %token.id(), from = session.state.name(), to = next.name(), "transition");
            session.state = next;
            session.last_event = Some(event.clone());
        }
        if let Some((state, reason)) = terminal {
            self.registry.revoke(token.id());
            self.metrics.record_terminal(state, reason);
            info!(attempt = %token.id(), state, reason, "checkout attempt finished");
        }
        let _ = self.progress.send(event);
        true
    }

    /// Publish a non-transition progress event for the current attempt.
    fn emit(&self, token: &AttemptToken, event: ProgressEvent) {
        {
            let mut session = self.session();
            if session.attempt != Some(token.id()) || !token.is_current() || session.state.is_terminal() {
                return;
            }
            session.last_event = Some(event.clone());
        }
        let _ = self.progress.send(event);
    }

    fn fail_creation(&self, token: &AttemptToken, err: CheckoutError) -> CheckoutError {
        if !token.is_current() {
            debug!(attempt = %token.id(), error = %err, "creation failed after attempt was superseded");
            return CheckoutError::Superseded;
        }
        warn!(attempt = %token.id(), error = %err, "checkout creation failed");
        let message = err.user_message();
        let failed = CheckoutState::Failed { reason: FailureReason::from_error(&err), message: message.clone() };
        self.transition(token, failed, ProgressEvent::new(token.id(), ProgressStatus::Failed, message));
        err
    }

    async fn finish_confirmed(&self, token: &AttemptToken, order: Order, source: ConfirmationSource) -> bool {
        let order_id = order.order_id.clone();
        let event = ProgressEvent::new(
            token.id(),
            ProgressStatus::Confirmed,
            format!("Order {} confirmed", order.order_number),
        );
        if !self.transition(token, CheckoutState::Confirmed { order, source }, event) {
            return false;
        }
        if let Err(e) = self.cart.clear().await {
            warn!(order_id = %order_id, error = %e, "failed to clear cart after confirmation");
            self.metrics.record_collaborator_error("cart", "clear");
        }
        if source != ConfirmationSource::Offline {
            self.record_payment(order_id, PaymentOutcome::Success);
        }
        true
    }

    /// Fire-and-forget annotation on the order; never affects the state machine.
    fn record_payment(&self, order_id: String, outcome: PaymentOutcome) {
        let orders = self.orders.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            if let Err(e) = orders.record_external_payment(&order_id, outcome).await {
                warn!(order_id = %order_id, error = %e, "failed to record external payment result");
                metrics.record_collaborator_error("order-service", "record_external_payment");
            }
        });
    }

    /// Body of one attempt: creation phases, then the waiting driver. `reply`
    /// answers the submitting caller as soon as the attempt is waiting or done.
    async fn run(
        self: Arc<Self>,
        token: AttemptToken,
        draft: OrderDraft,
        manual: Arc<Notify>,
        reply: oneshot::Sender<Result<CheckoutSnapshot, CheckoutError>>,
    ) {
        info!(
            attempt = %token.id(),
            submission = %draft.submission_id,
            method = draft.payment_method.code(),
            "checkout attempt started"
        );
        match self.open(&token, &draft).await {
            Ok(Some((order, request))) => {
                let _ = reply.send(Ok(self.session().snapshot()));
                self.drive(token, order, request, manual).await;
            }
            Ok(None) => {
                let _ = reply.send(Ok(self.session().snapshot()));
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    /// Create the order and, for online methods, the payment request. `None`
    /// means the attempt already finished (cash on delivery).
    async fn open(
        &self,
        token: &AttemptToken,
        draft: &OrderDraft,
    ) -> Result<Option<(Order, PaymentRequest)>, CheckoutError> {
        let on_order = |order: &Order| {
            let creating = CheckoutState::CreatingPayment { order_id: order.order_id.clone() };
            let event = ProgressEvent::new(token.id(), ProgressStatus::CreatingPayment, "Creating payment request");
            if self.transition(token, creating, event) {
                Ok(())
            } else {
                Err(CheckoutError::Superseded)
            }
        };
        let (order, request) = match self.initiator.initiate(draft, token.id(), on_order).await {
            Ok(Initiated::Online { order, request }) => (order, request),
            Ok(Initiated::Offline(order)) => {
                return if self.finish_confirmed(token, order, ConfirmationSource::Offline).await {
                    Ok(None)
                } else {
                    Err(CheckoutError::Superseded)
                };
            }
            Err(err) => return Err(self.fail_creation(token, err)),
        };

        let channel = request.delivery_channel;
        let waiting = CheckoutState::Waiting {
            channel,
            order_id: order.order_id.clone(),
            request_id: request.request_id.clone(),
            pay_url: request.pay_url.clone(),
        };
        let event = match channel {
            DeliveryChannel::Redirect => ProgressEvent::new(
                token.id(),
                ProgressStatus::Redirect,
                "Complete the payment on the provider page",
            ),
            DeliveryChannel::Poll => {
                ProgressEvent::new(token.id(), ProgressStatus::Polling, "Waiting for payment confirmation")
            }
        }
        .on_channel(channel);
        if !self.transition(token, waiting, event) {
            return Err(CheckoutError::Superseded);
        }
        info!(attempt = %token.id(), order_id = %order.order_id, channel = channel.as_str(), "waiting for payment");
        Ok(Some((order, request)))
    }

    async fn drive(self: Arc<Self>, token: AttemptToken, order: Order, request: PaymentRequest, manual: Arc<Notify>) {
        let channel = request.delivery_channel;
        let settings = self.settings.poll;
        let deadline = Instant::now() + settings.timeout;
        let max_attempts = settings.max_attempts();
        let order_id = order.order_id.as_str();
        let request_id = request.request_id.as_deref();
        let mut listener = CrossTabBroadcastListener::subscribe(&self.bus, token.clone());

        let poll = async {
            match (channel, request_id) {
                (DeliveryChannel::Poll, Some(request_id)) => {
                    self.poller
                        .poll(request_id, Some(order_id), settings, &token, |n| {
                            let event = ProgressEvent::new(
                                token.id(),
                                ProgressStatus::Polling,
                                format!("Checking payment status ({n}/{max_attempts})"),
                            )
                            .on_channel(channel)
                            .with_count(n);
                            self.emit(&token, event);
                        })
                        .await
                }
                _ => std::future::pending().await,
            }
        };
        tokio::pin!(poll);

        loop {
            let step = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                polled = &mut poll => match polled {
                    Ok(a) => Step::Polled { outcome: a.outcome, source: a.source, attempts: a.attempts },
                    Err(Cancelled) => return,
                },
                signal = listener.next_signal() => match signal {
                    Some((signal, via)) => Step::Signal(signal, via),
                    None => return,
                },
                _ = manual.notified() => Step::Manual,
                _ = sleep_until(deadline), if channel == DeliveryChannel::Redirect => Step::Expired,
            };

            match step {
                Step::Polled { outcome, source, attempts } => {
                    self.settle(&token, &order, outcome, source, Some(attempts), deadline).await;
                    return;
                }
                Step::Signal(signal, via) => {
                    let request_mismatch = matches!(
                        (signal.request_id.as_deref(), request_id),
                        (Some(theirs), Some(ours)) if theirs != ours
                    );
                    if signal.order_id != order.order_id || request_mismatch {
                        debug!(attempt = %token.id(), signal_order = %signal.order_id, "ignoring signal for another order");
                        self.metrics.record_signal(via.as_str(), "ignored");
                        continue;
                    }
                    self.metrics.record_signal(via.as_str(), "accepted");
                    info!(attempt = %token.id(), order_id, channel = via.as_str(), result_code = ?signal.result_code, "completion signal received");
                    let mut outcome = decode_optional_code(signal.result_code);
                    if !outcome.is_decisive() {
                        outcome = self.poller.check_once(request_id, Some(order_id)).await.0;
                    }
                    if outcome.is_decisive() {
                        self.settle(&token, &order, outcome, ConfirmationSource::Broadcast, None, deadline).await;
                        return;
                    }
                    self.emit(
                        &token,
                        ProgressEvent::new(token.id(), ProgressStatus::Reconciling, "Payment result received, still confirming")
                            .on_channel(channel),
                    );
                }
                Step::Manual => {
                    let (outcome, _) = self.poller.check_once(request_id, Some(order_id)).await;
                    if outcome.is_decisive() {
                        self.settle(&token, &order, outcome, ConfirmationSource::Manual, None, deadline).await;
                        return;
                    }
                    self.emit(
                        &token,
                        ProgressEvent::new(token.id(), ProgressStatus::Reconciling, "Payment not confirmed yet")
                            .on_channel(channel),
                    );
                }
                Step::Expired => {
                    self.settle(&token, &order, PaymentOutcome::Pending, ConfirmationSource::Broadcast, None, deadline)
                        .await;
                    return;
                }
            }
        }
    }

    /// Turn a payment-side verdict into a terminal state. Success is only
    /// believed once the order service agrees, and failure is never recorded
    /// against an order that already reads as paid.
    async fn settle(
        &self,
        token: &AttemptToken,
        order: &Order,
        outcome: PaymentOutcome,
        source: ConfirmationSource,
        attempts: Option<u32>,
        deadline: Instant,
    ) {
        let id = token.id();
        match outcome {
            PaymentOutcome::Success => {
                self.emit(
                    token,
                    ProgressEvent::new(id, ProgressStatus::Reconciling, "Payment received, confirming your order"),
                );
                let budget = deadline
                    .saturating_duration_since(Instant::now())
                    .max(self.settings.reconcile_interval);
                let result = tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    result = self.reconciler.reconcile(&order.order_id, budget, source) => result,
                };
                if result.confirmed {
                    let confirmed = result.order.unwrap_or_else(|| order.clone());
                    self.finish_confirmed(token, confirmed, source).await;
                } else if result.order.as_ref().is_some_and(|o| o.status.is_dead()) {
                    let failed = CheckoutState::Failed {
                        reason: FailureReason::OrderRejected,
                        message: "The order was closed before the payment could be confirmed.".into(),
                    };
                    self.transition(token, failed, ProgressEvent::new(id, ProgressStatus::Failed, "Order closed"));
                } else {
                    warn!(attempt = %id, order_id = %order.order_id, "payment reported success but order is not paid");
                    self.metrics.record_mismatch();
                    let timeout = CheckoutState::Timeout {
                        reason: TimeoutReason::ReconciliationMismatch,
                        order_id: order.order_id.clone(),
                    };
                    let event = ProgressEvent::new(
                        id,
                        ProgressStatus::Timeout,
                        "Payment received, order updating. Please wait or contact support.",
                    );
                    self.transition(token, timeout, event);
                }
            }
            PaymentOutcome::Failed => {
                // the order of record outranks a provider-side failure report
                let order_known_unpaid = match self.orders.get_order(&order.order_id).await {
                    Ok(current) if current.status.is_paid() => {
                        warn!(attempt = %id, order_id = %order.order_id, "payment reported failure but order is paid");
                        self.finish_confirmed(token, current, source).await;
                        return;
                    }
                    Ok(_) => true,
                    Err(e) => {
                        warn!(attempt = %id, order_id = %order.order_id, error = %e, "order check before failing attempt failed");
                        self.metrics.record_collaborator_error("order-service", "get_order");
                        false
                    }
                };
                let failed = CheckoutState::Failed {
                    reason: FailureReason::PaymentDeclined,
                    message: "The payment was not completed.".into(),
                };
                if self.transition(token, failed, ProgressEvent::new(id, ProgressStatus::Failed, "Payment failed"))
                    && order_known_unpaid
                {
                    self.record_payment(order.order_id.clone(), PaymentOutcome::Failed);
                }
            }
            PaymentOutcome::Pending | PaymentOutcome::Unknown => {
                let timeout = CheckoutState::Timeout {
                    reason: TimeoutReason::AwaitingConfirmation,
                    order_id: order.order_id.clone(),
                };
                let mut event = ProgressEvent::new(
                    id,
                    ProgressStatus::Timeout,
                    "We have not received payment confirmation yet. Your order is kept open.",
                );
                if let Some(n) = attempts {
                    event = event.with_count(n);
                }
                self.transition(token, timeout, event);
            }
        }
    }
}

fn terminal_labels(state: &CheckoutState) -> Option<(&'static str, &'static str)> {
    match state {
        CheckoutState::Confirmed { source, .. } => Some((state.name(), source.as_str())),
        CheckoutState::Failed { reason, .. } => Some((state.name(), reason.as_str())),
        CheckoutState::Timeout { reason, .. } => Some((state.name(), reason.as_str())),
        _ => None,
    }
}
