use std::collections::BTreeMap;

use axum::{http::{StatusCode, HeaderValue}, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use uuid::Uuid;

#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")] pub trace_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")] pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")] pub fields: Option<BTreeMap<String, String>>,
    /// Set when the caller may safely try the same action again.
    #[serde(skip_serializing_if = "std::ops::Not::not")] pub retryable: bool,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    /// Field-keyed validation failure (form re-shown with per-field messages).
    Unprocessable { code: &'static str, fields: BTreeMap<String, String>, trace_id: Option<Uuid> },
    NotFound { code: &'static str, trace_id: Option<Uuid> },
    Conflict { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    /// An upstream collaborator failed; the action can be retried by the user.
    BadGateway { code: &'static str, trace_id: Option<Uuid>, message: Option<String> },
    Internal { trace_id: Option<Uuid>, message: Option<String> },
}

impl ApiError {
    pub fn internal<E: std::fmt::Display>(e: E, trace_id: Option<Uuid>) -> Self { Self::Internal { trace_id, message: Some(e.to_string()) } }
    pub fn bad_request(code: &'static str, trace_id: Option<Uuid>) -> Self { Self::BadRequest { code, trace_id, message: None } }
    pub fn bad_gateway<E: std::fmt::Display>(code: &'static str, e: E) -> Self { Self::BadGateway { code, trace_id: None, message: Some(e.to_string()) } }
    pub fn conflict<E: std::fmt::Display>(code: &'static str, e: E) -> Self { Self::Conflict { code, trace_id: None, message: Some(e.to_string()) } }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = |code: &str, trace_id, message, fields, retryable| ErrorBody { code: code.into(), trace_id, message, fields, retryable };
        let (status, body, error_code) = match self {
            ApiError::BadRequest { code, trace_id, message } => (
                StatusCode::BAD_REQUEST,
                body(code, trace_id, message, None, false),
                code
            ),
            ApiError::Unprocessable { code, fields, trace_id } => (
                StatusCode::UNPROCESSABLE_ENTITY,
                body(code, trace_id, None, Some(fields), false),
                code
            ),
            ApiError::NotFound { code, trace_id } => (
                StatusCode::NOT_FOUND,
                body(code, trace_id, None, None, false),
                code
            ),
            ApiError::Conflict { code, trace_id, message } => (
                StatusCode::CONFLICT,
                body(code, trace_id, message, None, false),
                code
            ),
            ApiError::BadGateway { code, trace_id, message } => (
                StatusCode::BAD_GATEWAY,
                body(code, trace_id, message, None, true),
                code
            ),
            ApiError::Internal { trace_id, message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                body("internal_error", trace_id, message, None, false),
                "internal_error"
            ),
        };
        let mut resp = (status, Json(body)).into_response();
        if let Ok(val) = HeaderValue::from_str(error_code) {
            resp.headers_mut().insert("X-Error-Code", val);
        }
        resp
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
