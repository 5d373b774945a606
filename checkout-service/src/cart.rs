use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::draft::CartLine;
use crate::error::{ServiceError, ServiceResult};

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn read_line_items(&self) -> ServiceResult<Vec<CartLine>>;
    async fn replace_line_items(&self, lines: Vec<CartLine>) -> ServiceResult<()>;
    async fn clear(&self) -> ServiceResult<()>;
}

// ---------------- HTTP Implementation ----------------

#[derive(Serialize, Deserialize)]
struct CartDto {
    #[serde(default, alias = "lineItems", alias = "lines")]
    items: Vec<CartLine>,
}

/// Cart held by a separate cart service at `{base}/cart`.
#[derive(Clone)]
pub struct HttpCartStore {
    client: Client,
    base_url: String,
}

impl HttpCartStore {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    fn cart_url(&self) -> String {
        format!("{}/cart", self.base_url)
    }

    async fn expect_success(resp: reqwest::Response) -> ServiceResult<reqwest::Response> {
        if resp.status().is_success() {
            Ok(resp)
        } else {
            Err(ServiceError::Status {
                service: "cart-service",
                status: resp.status().as_u16(),
                body: resp.text().await.unwrap_or_default(),
            })
        }
    }
}

#[async_trait]
impl CartStore for HttpCartStore {
    async fn read_line_items(&self) -> ServiceResult<Vec<CartLine>> {
        let resp = self.client.get(self.cart_url()).send().await?;
        // no cart yet reads as an empty one
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let dto = Self::expect_success(resp)
            .await?
            .json::<CartDto>()
            .await
            .map_err(|e| ServiceError::Decode { service: "cart-service", message: e.to_string() })?;
        Ok(dto.items)
    }

    async fn replace_line_items(&self, lines: Vec<CartLine>) -> ServiceResult<()> {
        let resp = self.client.put(self.cart_url()).json(&CartDto { items: lines }).send().await?;
        Self::expect_success(resp).await.map(|_| ())
    }

    async fn clear(&self) -> ServiceResult<()> {
        let resp = self.client.delete(self.cart_url()).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success(resp).await.map(|_| ())
    }
}

// ---------------- In-Memory Implementation ----------------

#[derive(Default)]
struct CartState {
    lines: Vec<CartLine>,
    clears: usize,
}

/// Process-local cart. The binary falls back to it when no cart service is
/// configured; tests use it to count clears.
#[derive(Clone, Default)]
pub struct InMemoryCartStore {
    inner: Arc<Mutex<CartState>>,
}

impl InMemoryCartStore {
    pub fn with_lines(lines: Vec<CartLine>) -> Self {
        Self { inner: Arc::new(Mutex::new(CartState { lines, clears: 0 })) }
    }

    pub async fn replace(&self, lines: Vec<CartLine>) {
        self.inner.lock().await.lines = lines;
    }

    pub async fn clear_count(&self) -> usize {
        self.inner.lock().await.clears
    }
}

#[async_trait]
impl CartStore for InMemoryCartStore {
    async fn read_line_items(&self) -> ServiceResult<Vec<CartLine>> {
        Ok(self.inner.lock().await.lines.clone())
    }

    async fn replace_line_items(&self, lines: Vec<CartLine>) -> ServiceResult<()> {
        self.replace(lines).await;
        Ok(())
    }

    async fn clear(&self) -> ServiceResult<()> {
        let mut state = self.inner.lock().await;
        state.lines.clear();
        state.clears += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common_money::Money;
    use httpmock::prelude::*;
    use serde_json::json;

    #[tokio::test]
    async fn clear_empties_and_counts() {
        let cart = InMemoryCartStore::with_lines(vec![CartLine {
            product_id: Some("p-1".into()),
            variant_id: None,
            quantity: 1,
            unit_price: Money::from_cents(500),
        }]);
        assert_eq!(cart.read_line_items().await.unwrap().len(), 1);
        cart.clear().await.unwrap();
        assert!(cart.read_line_items().await.unwrap().is_empty());
        assert_eq!(cart.clear_count().await, 1);
    }

    #[tokio::test]
    async fn http_cart_reads_items_and_treats_missing_cart_as_empty() {
        let server = MockServer::start();
        let found = server.mock(|when, then| {
            when.method(GET).path("/cart");
            then.status(200).json_body(json!({
                "lineItems": [{ "productId": "sku-9", "quantity": 3, "unitPrice": "12.50" }]
            }));
        });
        let cart = HttpCartStore::new(Client::new(), format!("{}/", server.base_url()));
        let lines = cart.read_line_items().await.unwrap();
        found.assert();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].product_id.as_deref(), Some("sku-9"));
        assert_eq!(lines[0].unit_price, Money::from_cents(1_250));

        let empty_server = MockServer::start();
        empty_server.mock(|when, then| {
            when.method(GET).path("/cart");
            then.status(404);
        });
        let cart = HttpCartStore::new(Client::new(), empty_server.base_url());
        assert!(cart.read_line_items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn http_cart_replace_and_clear() {
        let server = MockServer::start();
        let put = server.mock(|when, then| {
            when.method(PUT).path("/cart").body_contains("\"productId\":\"sku-1\"");
            then.status(204);
        });
        let delete = server.mock(|when, then| {
            when.method(DELETE).path("/cart");
            then.status(204);
        });
        let cart = HttpCartStore::new(Client::new(), server.base_url());
        cart.replace_line_items(vec![CartLine {
            product_id: Some("sku-1".into()),
            variant_id: None,
            quantity: 1,
            unit_price: Money::from_cents(500),
        }])
        .await
        .unwrap();
        cart.clear().await.unwrap();
        put.assert();
        delete.assert();
    }

    #[tokio::test]
    async fn http_cart_surfaces_upstream_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(DELETE).path("/cart");
            then.status(503).body("down");
        });
        let cart = HttpCartStore::new(Client::new(), server.base_url());
        let err = cart.clear().await.unwrap_err();
        assert!(matches!(err, ServiceError::Status { status: 503, .. }));
    }
}
