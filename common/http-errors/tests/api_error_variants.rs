use std::collections::BTreeMap;

use common_http_errors::ApiError;
use axum::body::to_bytes;
use axum::response::IntoResponse;
use axum::http::StatusCode;
use uuid::Uuid;

#[test]
fn bad_request_variant() {
    let err = ApiError::BadRequest { code: "invalid_something", trace_id: None, message: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_something");
}

#[tokio::test]
async fn unprocessable_variant_carries_fields() {
    let mut fields = BTreeMap::new();
    fields.insert("phone".to_string(), "must contain 10 to 11 digits".to_string());
    let err = ApiError::Unprocessable { code: "invalid_draft", fields, trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "invalid_draft");
    let bytes = to_bytes(resp.into_body(), 1024 * 16).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["fields"]["phone"], "must contain 10 to 11 digits");
    assert!(v.get("retryable").is_none());
}

#[test]
fn not_found_variant() {
    let err = ApiError::NotFound { code: "missing_resource", trace_id: None };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "missing_resource");
}

#[test]
fn conflict_variant() {
    let resp = ApiError::conflict("not_waiting", "no attempt is waiting").into_response();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "not_waiting");
}

#[tokio::test]
async fn bad_gateway_is_retryable() {
    let resp = ApiError::bad_gateway("create_order_failed", "connection refused").into_response();
    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let bytes = to_bytes(resp.into_body(), 1024 * 16).await.unwrap();
    let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(v["retryable"], true);
    assert_eq!(v["message"], "connection refused");
}

#[test]
fn internal_variant() {
    let trace = Some(Uuid::new_v4());
    let err = ApiError::Internal { trace_id: trace, message: Some("boom".into()) };
    let resp = err.into_response();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(resp.headers().get("X-Error-Code").unwrap(), "internal_error");
}
