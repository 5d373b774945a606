use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use checkout_service::cart::InMemoryCartStore;
use checkout_service::controller::ControllerSettings;
use checkout_service::draft::{CartLine, OrderDraftBuilder};
use checkout_service::model::OrderStatus;
use checkout_service::order_client::InMemoryOrderService;
use checkout_service::payment_client::{InMemoryPaymentService, ReceiptMode};
use checkout_service::{build_router, AppState};
use common_money::Money;
use common_observability::CheckoutMetrics;
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    orders: InMemoryOrderService,
    payments: InMemoryPaymentService,
    cart: InMemoryCartStore,
}

fn test_app(mode: ReceiptMode) -> TestApp {
    app_over(
        mode,
        InMemoryCartStore::with_lines(vec![CartLine {
            product_id: Some("sku-1".into()),
            variant_id: None,
            quantity: 2,
            unit_price: Money::from_cents(15_000),
        }]),
    )
}

fn app_over(mode: ReceiptMode, cart: InMemoryCartStore) -> TestApp {
    let orders = InMemoryOrderService::default();
    let payments = InMemoryPaymentService::new(mode);
    let state = AppState::new(
        Arc::new(orders.clone()),
        Arc::new(payments.clone()),
        Arc::new(cart.clone()),
        OrderDraftBuilder::default(),
        ControllerSettings::default(),
        Arc::new(CheckoutMetrics::new().unwrap()),
    );
    TestApp { router: build_router(state), orders, payments, cart }
}

fn form(method: &str) -> Value {
    json!({
        "fullName": "Vo Thi F",
        "phone": "0903 111 222",
        "address": "21 Hai Ba Trung, Quan 1",
        "paymentMethod": method,
    })
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Option<String>, Value) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let code = resp
        .headers()
        .get("X-Error-Code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, code, body)
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn put_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn invalid_form_returns_field_map() {
    let app = test_app(ReceiptMode::Poll);
    let bad = json!({ "fullName": "", "phone": "123", "address": "short", "paymentMethod": "" });
    let (status, code, body) = send(&app.router, post_json("/checkout", &bad)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(code.as_deref(), Some("invalid_draft"));
    for field in ["fullName", "phone", "address", "paymentMethod"] {
        assert!(body["fields"][field].is_string(), "missing {field} in {body}");
    }
    assert_eq!(app.orders.create_calls().await, 0);
}

#[tokio::test]
async fn cod_checkout_confirms_and_clears_cart() {
    let app = test_app(ReceiptMode::Poll);
    let (status, _, body) = send(&app.router, post_json("/checkout", &form("cod"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "CONFIRMED");
    assert_eq!(body["source"], "OFFLINE");
    assert_eq!(body["order"]["total"], "300.00");
    assert_eq!(app.cart.clear_count().await, 1);
    assert_eq!(app.payments.create_calls().await, 0);
}

#[tokio::test]
async fn cart_loaded_over_http_feeds_checkout() {
    let app = app_over(ReceiptMode::Poll, InMemoryCartStore::default());
    let (status, code, _) = send(&app.router, post_json("/checkout", &form("cod"))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(code.as_deref(), Some("invalid_draft"));

    let items = json!({ "items": [
        { "productId": "sku-tea", "quantity": 3, "unitPrice": "40.00" },
        { "productId": "sku-cup", "variantId": "blue", "quantity": 1, "unitPrice": "25.50" }
    ]});
    let (status, _, cart) = send(&app.router, put_json("/cart", &items)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["subtotal"], "145.50");
    let (_, _, cart) = send(&app.router, get("/cart")).await;
    assert_eq!(cart["items"].as_array().map(Vec::len), Some(2));

    let (status, _, body) = send(&app.router, post_json("/checkout", &form("cod"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "CONFIRMED");
    assert_eq!(body["order"]["total"], "145.50");
    assert_eq!(app.cart.clear_count().await, 1);
    let (_, _, cart) = send(&app.router, get("/cart")).await;
    assert_eq!(cart["items"].as_array().map(Vec::len), Some(0));
}

#[tokio::test]
async fn redirect_return_page_completes_checkout() {
    let app = test_app(ReceiptMode::Redirect);
    let (status, _, body) = send(&app.router, post_json("/checkout", &form("momo"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "WAITING");
    assert_eq!(body["channel"], "REDIRECT");
    let order_id = body["orderId"].as_str().unwrap().to_string();
    let request_id = body["requestId"].as_str().unwrap().to_string();

    app.orders.set_status(&order_id, OrderStatus::Paid).await;
    let uri = format!("/payments/return?orderId={order_id}&requestId={request_id}&resultCode=0");
    let (status, _, ack) = send(&app.router, get(&uri)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ack["delivered"] == "direct" || ack["delivered"] == "relayed");

    let mut last = Value::Null;
    for _ in 0..200 {
        let (_, _, snap) = send(&app.router, get("/checkout/status")).await;
        if snap["state"] == "CONFIRMED" {
            last = snap;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(last["source"], "BROADCAST");
    assert_eq!(app.cart.clear_count().await, 1);
}

#[tokio::test]
async fn return_page_requires_order_id() {
    let app = test_app(ReceiptMode::Redirect);
    let (status, code, _) = send(&app.router, get("/payments/return?resultCode=0")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code.as_deref(), Some("missing_order_id"));
}

#[tokio::test]
async fn confirm_without_waiting_attempt_conflicts() {
    let app = test_app(ReceiptMode::Poll);
    let (status, code, body) = send(&app.router, post_json("/checkout/confirm", &json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(code.as_deref(), Some("not_waiting"));
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn cancel_and_status_round_trip() {
    let app = test_app(ReceiptMode::Poll);
    let (_, _, body) = send(&app.router, post_json("/checkout", &form("momo"))).await;
    assert_eq!(body["state"], "WAITING");
    let (status, _, cancelled) = send(&app.router, post_json("/checkout/cancel", &json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancelled["state"], "FAILED");
    assert_eq!(cancelled["reason"], "cancelled");
    let (_, _, snap) = send(&app.router, get("/checkout/status")).await;
    assert_eq!(snap["state"], "FAILED");
}

#[tokio::test]
async fn idempotency_key_pins_the_attempt() {
    let app = test_app(ReceiptMode::Poll);
    let key = "6f9619ff-8b86-4011-b42d-00cf4fc964ff";
    let req = || {
        Request::builder()
            .method("POST")
            .uri("/checkout")
            .header("content-type", "application/json")
            .header("Idempotency-Key", key)
            .body(Body::from(form("momo").to_string()))
            .unwrap()
    };
    let (_, _, first) = send(&app.router, req()).await;
    let (_, _, second) = send(&app.router, req()).await;
    assert_eq!(first["attemptId"], second["attemptId"]);
    assert_eq!(app.orders.create_calls().await, 1);

    let bad = Request::builder()
        .method("POST")
        .uri("/checkout")
        .header("content-type", "application/json")
        .header("Idempotency-Key", "not-a-uuid")
        .body(Body::from(form("momo").to_string()))
        .unwrap();
    let (status, code, _) = send(&app.router, bad).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(code.as_deref(), Some("invalid_idempotency_key"));
}

#[tokio::test]
async fn second_submission_supersedes_the_first() {
    let app = test_app(ReceiptMode::Poll);
    let (_, _, first) = send(&app.router, post_json("/checkout", &form("momo"))).await;
    let (_, _, second) = send(&app.router, post_json("/checkout", &form("momo"))).await;
    assert_eq!(second["state"], "WAITING");
    assert_ne!(first["attemptId"], second["attemptId"]);
    let (_, _, snap) = send(&app.router, get("/checkout/status")).await;
    assert_eq!(snap["attemptId"], second["attemptId"]);
    assert_eq!(app.orders.create_calls().await, 2);
}

#[tokio::test]
async fn health_and_metrics() {
    let app = test_app(ReceiptMode::Poll);
    let resp = app.router.clone().oneshot(get("/healthz")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    send(&app.router, post_json("/checkout", &form("cod"))).await;
    let resp = app.router.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("checkout_terminal_states_total"), "{text}");
}
