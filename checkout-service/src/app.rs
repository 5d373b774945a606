use std::sync::Arc;

use anyhow::Context;
use axum::http::{header::{ACCEPT, CONTENT_TYPE}, HeaderName, HeaderValue, Method, StatusCode};
use axum::{extract::State, routing::{get, post}, Router};
use common_observability::CheckoutMetrics;
use reqwest::Client;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use crate::broadcast::BroadcastBus;
use crate::cart::{CartStore, HttpCartStore, InMemoryCartStore};
use crate::checkout_handlers::{
    cancel_checkout, checkout_status, confirm_checkout, payment_return, read_cart, replace_cart, submit_checkout,
};
use crate::config::CheckoutConfig;
use crate::controller::{Collaborators, ControllerSettings, PaymentStateController};
use crate::draft::OrderDraftBuilder;
use crate::order_client::{HttpOrderService, OrderService};
use crate::payment_client::{HttpPaymentService, PaymentService};

pub async fn health() -> &'static str { "ok" }

#[derive(Clone)]
pub struct AppState {
    pub controller: PaymentStateController,
    pub cart: Arc<dyn CartStore>,
    pub draft_builder: Arc<OrderDraftBuilder>,
    pub bus: BroadcastBus,
    pub metrics: Arc<CheckoutMetrics>,
}

impl AppState {
    /// Wire a controller over the given collaborators. Used by the binary and by
    /// route tests with in-memory doubles.
    pub fn new(
        orders: Arc<dyn OrderService>,
        payments: Arc<dyn PaymentService>,
        cart: Arc<dyn CartStore>,
        draft_builder: OrderDraftBuilder,
        settings: ControllerSettings,
        metrics: Arc<CheckoutMetrics>,
    ) -> Self {
        let bus = BroadcastBus::default();
        let controller = PaymentStateController::new(
            Collaborators { orders, payments, cart: cart.clone() },
            bus.clone(),
            metrics.clone(),
            settings,
        );
        Self { controller, cart, draft_builder: Arc::new(draft_builder), bus, metrics }
    }
}

pub fn build_state(config: &CheckoutConfig) -> anyhow::Result<AppState> {
    let http_client = Client::builder()
        .timeout(config.http_timeout)
        .build()
        .context("failed to build HTTP client")?;
    let metrics = Arc::new(CheckoutMetrics::new().context("failed to register checkout metrics")?);
    let cart: Arc<dyn CartStore> = match &config.cart_service_url {
        Some(url) => Arc::new(HttpCartStore::new(http_client.clone(), url.clone())),
        None => Arc::new(InMemoryCartStore::default()),
    };
    info!(
        order_service = %config.order_service_url,
        payment_service = %config.payment_service_url,
        cart_service = config.cart_service_url.as_deref().unwrap_or("in-process"),
        "checkout collaborators configured"
    );
    Ok(AppState::new(
        Arc::new(HttpOrderService::new(http_client.clone(), config.order_service_url.clone())),
        Arc::new(HttpPaymentService::new(http_client, config.payment_service_url.clone())),
        cart,
        OrderDraftBuilder::new(config.draft_rules()),
        config.controller_settings(),
        metrics,
    ))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    match state.metrics.render() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("metrics encode error: {e}")),
    }
}

pub fn build_router(state: AppState) -> Router {
    let allowed_origins = [
        "http://localhost:3000",
        "http://localhost:3001",
        "http://localhost:5173",
    ];
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            allowed_origins.iter().filter_map(|o| o.parse::<HeaderValue>().ok()).collect::<Vec<_>>(),
        ))
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([ACCEPT, CONTENT_TYPE, HeaderName::from_static("idempotency-key")]);

    Router::new()
        .route("/healthz", get(health))
        .route("/cart", get(read_cart).put(replace_cart))
        .route("/checkout", post(submit_checkout))
        .route("/checkout/confirm", post(confirm_checkout))
        .route("/checkout/cancel", post(cancel_checkout))
        .route("/checkout/status", get(checkout_status))
        .route("/payments/return", get(payment_return))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(cors)
}
