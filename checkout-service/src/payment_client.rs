use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common_money::Money;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{ServiceError, ServiceResult};
use crate::order_client::IDEMPOTENCY_HEADER;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub order_id: String,
    pub amount: Money,
}

/// What the payment backend hands back for a new request. Either field may be
/// missing; the initiator decides which delivery channel applies.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct PaymentReceipt {
    #[serde(default, alias = "requestId", alias = "paymentId", alias = "id")]
    pub request_id: Option<String>,
    #[serde(default, alias = "payUrl", alias = "paymentUrl", alias = "redirectUrl")]
    pub pay_url: Option<String>,
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    async fn create_payment_request(
        &self,
        req: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> ServiceResult<PaymentReceipt>;
    /// Raw provider status payload; decoding is left to the codec.
    async fn get_payment_status(&self, request_id: &str) -> ServiceResult<Value>;
}

// ---------------- HTTP Implementation ----------------

#[derive(Clone)]
pub struct HttpPaymentService {
    client: Client,
    base_url: String,
}

impl HttpPaymentService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into().trim_end_matches('/').to_string() }
    }
}

async fn error_for(resp: reqwest::Response, what: String) -> ServiceError {
    match resp.status() {
        StatusCode::NOT_FOUND => ServiceError::NotFound(what),
        s => ServiceError::Status {
            service: "payment-service",
            status: s.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        },
    }
}

#[async_trait]
impl PaymentService for HttpPaymentService {
    async fn create_payment_request(
        &self,
        req: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> ServiceResult<PaymentReceipt> {
        let resp = self
            .client
            .post(format!("{}/payments", self.base_url))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(req)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for(resp, format!("order {}", req.order_id)).await);
        }
        resp.json::<PaymentReceipt>().await.map_err(|e| ServiceError::Decode {
            service: "payment-service",
            message: e.to_string(),
        })
    }

    async fn get_payment_status(&self, request_id: &str) -> ServiceResult<Value> {
        let resp = self
            .client
            .get(format!("{}/payments/{}/status", self.base_url, request_id))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(error_for(resp, format!("payment request {request_id}")).await);
        }
        resp.json::<Value>().await.map_err(|e| ServiceError::Decode {
            service: "payment-service",
            message: e.to_string(),
        })
    }
}

// ---------------- In-Memory Implementation (Tests) ----------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptMode {
    Redirect,
    Poll,
    /// Neither a pay URL nor a request id.
    Empty,
}

#[derive(Default)]
struct Ledger {
    next_id: u64,
    by_key: HashMap<String, PaymentReceipt>,
    amounts: HashMap<String, Money>,
    scripted: HashMap<String, VecDeque<(Duration, Value)>>,
    default_status: Option<Value>,
    create_failures: VecDeque<ServiceError>,
    status_failures: usize,
    create_calls: usize,
    status_calls: usize,
}

#[derive(Clone)]
pub struct InMemoryPaymentService {
    inner: Arc<Mutex<Ledger>>,
    mode: ReceiptMode,
}

impl InMemoryPaymentService {
    pub fn new(mode: ReceiptMode) -> Self {
        Self { inner: Arc::new(Mutex::new(Ledger::default())), mode }
    }

    /// Responses for successive status lookups of `request_id`, each returned after
    /// its delay. The last entry sticks.
    pub async fn script_statuses(
        &self,
        request_id: &str,
        statuses: impl IntoIterator<Item = (Duration, Value)>,
    ) {
        let mut ledger = self.inner.lock().await;
        ledger.scripted.insert(request_id.to_string(), statuses.into_iter().collect());
    }

    /// Status returned for any request without its own script.
    pub async fn set_default_status(&self, status: Value) {
        self.inner.lock().await.default_status = Some(status);
    }

    pub async fn fail_next_create(&self, err: ServiceError) {
        self.inner.lock().await.create_failures.push_back(err);
    }

    pub async fn fail_next_status_calls(&self, n: usize) {
        self.inner.lock().await.status_failures = n;
    }

    pub async fn create_calls(&self) -> usize {
        self.inner.lock().await.create_calls
    }

    pub async fn status_calls(&self) -> usize {
        self.inner.lock().await.status_calls
    }

    pub async fn amount_for(&self, request_id: &str) -> Option<Money> {
        self.inner.lock().await.amounts.get(request_id).cloned()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn create_payment_request(
        &self,
        req: &CreatePaymentRequest,
        idempotency_key: &str,
    ) -> ServiceResult<PaymentReceipt> {
        let mut ledger = self.inner.lock().await;
        ledger.create_calls += 1;
        if let Some(err) = ledger.create_failures.pop_front() {
            return Err(err);
        }
        if let Some(existing) = ledger.by_key.get(idempotency_key) {
            return Ok(existing.clone());
        }
        ledger.next_id += 1;
        let request_id = format!("pay-{}", ledger.next_id);
        let receipt = match self.mode {
            ReceiptMode::Redirect => PaymentReceipt {
                request_id: Some(request_id.clone()),
                pay_url: Some(format!("https://pay.example.test/{request_id}")),
            },
            ReceiptMode::Poll => PaymentReceipt { request_id: Some(request_id.clone()), pay_url: None },
            ReceiptMode::Empty => PaymentReceipt::default(),
        };
        ledger.amounts.insert(request_id, req.amount.clone());
        ledger.by_key.insert(idempotency_key.to_string(), receipt.clone());
        Ok(receipt)
    }

    async fn get_payment_status(&self, request_id: &str) -> ServiceResult<Value> {
        let (delay, value) = {
            let mut ledger = self.inner.lock().await;
            ledger.status_calls += 1;
            if ledger.status_failures > 0 {
                ledger.status_failures -= 1;
                return Err(ServiceError::Http("connection reset".into()));
            }
            let scripted = match ledger.scripted.get_mut(request_id) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            };
            match scripted {
                Some(entry) => entry,
                None => (
                    Duration::ZERO,
                    ledger
                        .default_status
                        .clone()
                        .unwrap_or_else(|| serde_json::json!({ "status": "PENDING" })),
                ),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn request() -> CreatePaymentRequest {
        CreatePaymentRequest { order_id: "42".into(), amount: Money::from_cents(2_350) }
    }

    #[tokio::test]
    async fn http_create_reads_receipt_aliases() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/payments")
                .header(IDEMPOTENCY_HEADER, "attempt-1:payment")
                .json_body(json!({ "orderId": "42", "amount": "23.50" }));
            then.status(200).json_body(json!({ "paymentId": "p-9", "paymentUrl": "https://pay/p-9" }));
        });
        let svc = HttpPaymentService::new(Client::new(), server.base_url());
        let receipt = svc.create_payment_request(&request(), "attempt-1:payment").await.unwrap();
        mock.assert();
        assert_eq!(receipt.request_id.as_deref(), Some("p-9"));
        assert_eq!(receipt.pay_url.as_deref(), Some("https://pay/p-9"));
    }

    #[tokio::test]
    async fn http_status_passes_raw_payload_through() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/payments/p-9/status");
            then.status(200).json_body(json!({ "data": { "resultCode": 0 } }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/payments/gone/status");
            then.status(404);
        });
        let svc = HttpPaymentService::new(Client::new(), server.base_url());
        assert_eq!(
            svc.get_payment_status("p-9").await.unwrap(),
            json!({ "data": { "resultCode": 0 } })
        );
        assert!(matches!(svc.get_payment_status("gone").await, Err(ServiceError::NotFound(_))));
    }

    #[tokio::test]
    async fn http_create_surfaces_server_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/payments");
            then.status(503).body("provider down");
        });
        let svc = HttpPaymentService::new(Client::new(), server.base_url());
        let err = svc.create_payment_request(&request(), "k").await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 503, .. }));
    }

    #[tokio::test]
    async fn in_memory_receipt_modes() {
        let redirect = InMemoryPaymentService::new(ReceiptMode::Redirect);
        let r = redirect.create_payment_request(&request(), "k").await.unwrap();
        assert!(r.pay_url.is_some());
        let again = redirect.create_payment_request(&request(), "k").await.unwrap();
        assert_eq!(r, again);

        let poll = InMemoryPaymentService::new(ReceiptMode::Poll);
        let r = poll.create_payment_request(&request(), "k").await.unwrap();
        assert_eq!(r.request_id.as_deref(), Some("pay-1"));
        assert!(r.pay_url.is_none());
        assert_eq!(poll.amount_for("pay-1").await, Some(Money::from_cents(2_350)));
    }
}
