use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::model::{ConfirmationSource, Order, ReconciliationResult};
use crate::order_client::OrderService;

/// The authority check. Payment-side success only counts once the order
/// service itself reports the order as paid or completed.
#[derive(Clone)]
pub struct OrderReconciler {
    orders: Arc<dyn OrderService>,
    interval: Duration,
}

impl OrderReconciler {
    pub fn new(orders: Arc<dyn OrderService>, interval: Duration) -> Self {
        Self { orders, interval }
    }

    pub async fn confirm_paid(&self, order_id: &str, budget: Duration) -> bool {
        self.reconcile(order_id, budget, ConfirmationSource::OrderPoll).await.confirmed
    }

    /// Check the order at least once, then every `interval` until it is paid,
    /// reaches a dead status, or `budget` runs out.
    pub async fn reconcile(
        &self,
        order_id: &str,
        budget: Duration,
        source: ConfirmationSource,
    ) -> ReconciliationResult {
        let deadline = Instant::now() + budget;
        let mut last_seen: Option<Order> = None;
        let mut checks = 0u32;
        loop {
            checks += 1;
            match self.orders.get_order(order_id).await {
                Ok(order) if order.status.is_paid() => {
                    info!(order_id, status = %order.status, source = source.as_str(), checks, "order confirmed paid");
                    return ReconciliationResult { confirmed: true, source, order: Some(order) };
                }
                Ok(order) if order.status.is_dead() => {
                    warn!(order_id, status = %order.status, "order is dead; payment will not be confirmed");
                    return ReconciliationResult { confirmed: false, source, order: Some(order) };
                }
                Ok(order) => {
                    debug!(order_id, status = %order.status, checks, "order not paid yet");
                    last_seen = Some(order);
                }
                Err(e) => warn!(order_id, error = %e, "order lookup failed during reconciliation"),
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(self.interval.min(deadline - now)).await;
        }
        ReconciliationResult { confirmed: false, source, order: last_seen }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::{CartLine, CheckoutForm, OrderDraftBuilder};
    use crate::model::OrderStatus;
    use crate::order_client::{InMemoryOrderService, OrderService as _};
    use common_money::Money;

    async fn seeded() -> (InMemoryOrderService, String) {
        let orders = InMemoryOrderService::default();
        let draft = OrderDraftBuilder::default()
            .build(
                &[CartLine {
                    product_id: Some("p".into()),
                    variant_id: None,
                    quantity: 1,
                    unit_price: Money::from_cents(990),
                }],
                &CheckoutForm {
                    full_name: "Hoang E".into(),
                    phone: "0987654321".into(),
                    address: "99 Tran Phu, Da Nang".into(),
                    payment_method: "momo".into(),
                    ..Default::default()
                },
            )
            .unwrap();
        let order = orders.create_order(&draft, "k").await.unwrap();
        (orders, order.order_id)
    }

    #[tokio::test(start_paused = true)]
    async fn confirms_once_order_flips() {
        let (orders, id) = seeded().await;
        orders
            .script_statuses(&id, [OrderStatus::PendingPayment, OrderStatus::PendingPayment, OrderStatus::Paid])
            .await;
        let rec = OrderReconciler::new(Arc::new(orders.clone()), Duration::from_secs(2));
        let result = rec.reconcile(&id, Duration::from_secs(30), ConfirmationSource::Broadcast).await;
        assert!(result.confirmed);
        assert_eq!(result.source, ConfirmationSource::Broadcast);
        assert_eq!(orders.get_calls().await, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_order_is_not_confirmed() {
        let (orders, id) = seeded().await;
        let rec = OrderReconciler::new(Arc::new(orders.clone()), Duration::from_secs(2));
        let started = Instant::now();
        assert!(!rec.confirm_paid(&id, Duration::from_secs(5)).await);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
        // checks at 0, 2, 4 and at the deadline
        assert_eq!(orders.get_calls().await, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_budget_still_checks_once() {
        let (orders, id) = seeded().await;
        orders.set_status(&id, OrderStatus::Completed).await;
        let rec = OrderReconciler::new(Arc::new(orders.clone()), Duration::from_secs(2));
        assert!(rec.confirm_paid(&id, Duration::ZERO).await);
        assert_eq!(orders.get_calls().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_order_stops_early() {
        let (orders, id) = seeded().await;
        orders.set_status(&id, OrderStatus::Cancelled).await;
        let rec = OrderReconciler::new(Arc::new(orders.clone()), Duration::from_secs(2));
        let result = rec.reconcile(&id, Duration::from_secs(60), ConfirmationSource::Manual).await;
        assert!(!result.confirmed);
        assert_eq!(result.order.map(|o| o.status), Some(OrderStatus::Cancelled));
        assert_eq!(orders.get_calls().await, 1);
    }
}
