use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use common_money::Money;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::codec::PaymentOutcome;
use crate::draft::OrderDraft;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{Order, OrderStatus};

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// The order-of-record backend.
#[async_trait]
pub trait OrderService: Send + Sync {
    async fn create_order(&self, draft: &OrderDraft, idempotency_key: &str) -> ServiceResult<Order>;
    async fn get_order(&self, order_id: &str) -> ServiceResult<Order>;
    /// Best-effort annotation of what the payment side reported.
    async fn record_external_payment(&self, order_id: &str, outcome: PaymentOutcome) -> ServiceResult<()>;
}

// ---------------- HTTP Implementation ----------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderDto {
    #[serde(alias = "id", alias = "order_id")]
    order_id: String,
    #[serde(default, alias = "order_number")]
    order_number: Option<String>,
    status: String,
    total: Money,
}

impl OrderDto {
    fn into_order(self) -> ServiceResult<Order> {
        let status = OrderStatus::parse(&self.status).ok_or_else(|| ServiceError::Decode {
            service: "order-service",
            message: format!("unrecognized order status '{}'", self.status),
        })?;
        Ok(Order {
            order_number: self.order_number.unwrap_or_else(|| self.order_id.clone()),
            order_id: self.order_id,
            status,
            total: self.total,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PaymentResultBody<'a> {
    outcome: &'a str,
}

#[derive(Clone)]
pub struct HttpOrderService {
    client: Client,
    base_url: String,
}

impl HttpOrderService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    async fn decode(resp: reqwest::Response, what: &str) -> ServiceResult<Order> {
        match resp.status() {
            s if s.is_success() => {
                let dto = resp.json::<OrderDto>().await.map_err(|e| ServiceError::Decode {
                    service: "order-service",
                    message: e.to_string(),
                })?;
                dto.into_order()
            }
            StatusCode::NOT_FOUND => Err(ServiceError::NotFound(what.to_string())),
            s => Err(ServiceError::Status {
                service: "order-service",
                status: s.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl OrderService for HttpOrderService {
    async fn create_order(&self, draft: &OrderDraft, idempotency_key: &str) -> ServiceResult<Order> {
        let resp = self
            .client
            .post(format!("{}/orders", self.base_url))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(draft)
            .send()
            .await?;
        Self::decode(resp, "order").await
    }

    async fn get_order(&self, order_id: &str) -> ServiceResult<Order> {
        let resp = self
            .client
            .get(format!("{}/orders/{}", self.base_url, order_id))
            .send()
            .await?;
        Self::decode(resp, &format!("order {order_id}")).await
    }

    async fn record_external_payment(&self, order_id: &str, outcome: PaymentOutcome) -> ServiceResult<()> {
        let resp = self
            .client
            .post(format!("{}/orders/{}/payment-result", self.base_url, order_id))
            .json(&PaymentResultBody { outcome: outcome.as_str() })
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::Status {
                service: "order-service",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

// ---------------- In-Memory Implementation (Tests) ----------------

#[derive(Default)]
struct OrderBook {
    next_id: u64,
    orders: HashMap<String, Order>,
    by_key: HashMap<String, String>,
    scripted: HashMap<String, VecDeque<OrderStatus>>,
    create_failures: VecDeque<ServiceError>,
    create_calls: usize,
    get_calls: usize,
    recorded: Vec<(String, PaymentOutcome)>,
}

/// Order service double. Totals are computed "server side" as the line sum plus
/// a flat shipping fee.
#[derive(Clone)]
pub struct InMemoryOrderService {
    inner: Arc<Mutex<OrderBook>>,
    initial_status: OrderStatus,
    shipping_fee: Money,
}

impl Default for InMemoryOrderService {
    fn default() -> Self {
        Self::new(OrderStatus::PendingPayment)
    }
}

impl InMemoryOrderService {
    pub fn new(initial_status: OrderStatus) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OrderBook::default())),
            initial_status,
            shipping_fee: Money::zero(),
        }
    }

    pub fn with_shipping_fee(mut self, fee: Money) -> Self {
        self.shipping_fee = fee;
        self
    }

    /// Statuses returned by successive `get_order` calls; the last one sticks.
    pub async fn script_statuses(&self, order_id: &str, statuses: impl IntoIterator<Item = OrderStatus>) {
        let mut book = self.inner.lock().await;
        book.scripted.insert(order_id.to_string(), statuses.into_iter().collect());
    }

    pub async fn set_status(&self, order_id: &str, status: OrderStatus) {
        let mut book = self.inner.lock().await;
        book.scripted.remove(order_id);
        if let Some(order) = book.orders.get_mut(order_id) {
            order.status = status;
        }
    }

    pub async fn fail_next_create(&self, err: ServiceError) {
        self.inner.lock().await.create_failures.push_back(err);
    }

    pub async fn create_calls(&self) -> usize {
        self.inner.lock().await.create_calls
    }

    pub async fn get_calls(&self) -> usize {
        self.inner.lock().await.get_calls
    }

    pub async fn recorded_payments(&self) -> Vec<(String, PaymentOutcome)> {
        self.inner.lock().await.recorded.clone()
    }

    pub async fn order(&self, order_id: &str) -> Option<Order> {
        self.inner.lock().await.orders.get(order_id).cloned()
    }
}

#[async_trait]
impl OrderService for InMemoryOrderService {
    async fn create_order(&self, draft: &OrderDraft, idempotency_key: &str) -> ServiceResult<Order> {
        let mut book = self.inner.lock().await;
        book.create_calls += 1;
        if let Some(err) = book.create_failures.pop_front() {
            return Err(err);
        }
        if let Some(existing) = book.by_key.get(idempotency_key).and_then(|id| book.orders.get(id)) {
            debug!(order_id = %existing.order_id, "replaying idempotent order create");
            return Ok(existing.clone());
        }
        book.next_id += 1;
        let order_id = format!("ord-{}", book.next_id);
        let total = draft
            .line_items
            .iter()
            .map(|l| l.unit_price.times(l.quantity))
            .sum::<Money>()
            + &self.shipping_fee;
        let order = Order {
            order_id: order_id.clone(),
            order_number: format!("SO{:06}", book.next_id),
            status: self.initial_status,
            total,
        };
        book.orders.insert(order_id.clone(), order.clone());
        book.by_key.insert(idempotency_key.to_string(), order_id);
        Ok(order)
    }

    async fn get_order(&self, order_id: &str) -> ServiceResult<Order> {
        let mut book = self.inner.lock().await;
        book.get_calls += 1;
        let next = match book.scripted.get_mut(order_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().copied(),
            None => None,
        };
        let order = book
            .orders
            .get_mut(order_id)
            .ok_or_else(|| ServiceError::NotFound(format!("order {order_id}")))?;
        if let Some(status) = next {
            order.status = status;
        }
        Ok(order.clone())
    }

    async fn record_external_payment(&self, order_id: &str, outcome: PaymentOutcome) -> ServiceResult<()> {
        self.inner.lock().await.recorded.push((order_id.to_string(), outcome));
        Ok(())
    }
}
