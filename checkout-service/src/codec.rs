//! Normalizes payment provider and order-service status vocabularies into
//! [`PaymentOutcome`].
//!
//! Providers report progress as numeric result codes, string enums, or either
//! of those nested inside an envelope (`{"data": {"status": ...}}`). Everything
//! downstream of this module only ever sees `PaymentOutcome`. Anything that is
//! not positively recognized decodes to `Pending` or `Unknown`; only an exact
//! success word or a zero result code can produce `Success`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::OrderStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentOutcome {
    Pending,
    Success,
    Failed,
    Unknown,
}

impl PaymentOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Pending => "PENDING",
            PaymentOutcome::Success => "SUCCESS",
            PaymentOutcome::Failed => "FAILED",
            PaymentOutcome::Unknown => "UNKNOWN",
        }
    }

    /// Success and Failed end polling; Pending and Unknown keep waiting.
    pub fn is_decisive(&self) -> bool {
        matches!(self, PaymentOutcome::Success | PaymentOutcome::Failed)
    }
}

const SUCCESS_WORDS: &[&str] = &["SUCCESS", "SUCCEEDED", "PAID", "COMPLETED"];
const FAILURE_WORDS: &[&str] = &[
    "FAILED", "FAILURE", "FAIL", "ERROR", "CANCELLED", "CANCELED", "DECLINED", "REJECTED",
    "EXPIRED", "VOIDED", "ABORTED",
];
const PENDING_WORDS: &[&str] = &[
    "PENDING", "PROCESSING", "IN_PROGRESS", "CREATED", "INITIATED", "WAITING", "AUTHORIZED",
    "REQUIRES_ACTION", "PENDING_PAYMENT",
];
/// Non-zero result codes providers use for "accepted, still processing".
const PENDING_CODES: &[i64] = &[1000, 7000, 7002, 9000];
/// Result codes that explicitly mean the shopper cancelled or the provider declined.
const FAILURE_CODES: &[i64] = &[49, 1003, 1004, 1005, 1006];

const STATUS_FIELDS: &[&str] = &[
    "status", "state", "paymentStatus", "payment_status", "transactionStatus",
];
const CODE_FIELDS: &[&str] = &["resultCode", "result_code", "responseCode", "response_code"];
const ENVELOPE_FIELDS: &[&str] = &["data", "result", "payment", "payload", "transaction"];
const MAX_DEPTH: usize = 4;

/// Decode a raw provider status payload.
pub fn decode_payment_status(payload: &Value) -> PaymentOutcome {
    decode_value(payload, 0)
}

/// Decode a provider status word. Matching is exact after trimming and upper-casing.
pub fn decode_status_str(raw: &str) -> PaymentOutcome {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return PaymentOutcome::Unknown;
    }
    if let Ok(code) = trimmed.parse::<i64>() {
        return decode_result_code(code);
    }
    let word = trimmed.to_ascii_uppercase().replace(&['-', ' '][..], "_");
    if SUCCESS_WORDS.contains(&word.as_str()) {
        PaymentOutcome::Success
    } else if FAILURE_WORDS.contains(&word.as_str()) {
        PaymentOutcome::Failed
    } else if PENDING_WORDS.contains(&word.as_str()) {
        PaymentOutcome::Pending
    } else {
        PaymentOutcome::Unknown
    }
}

/// Provider result codes: zero is success, known cancel/decline codes are
/// failures, a small set means "still processing". Anything else is unknown.
pub fn decode_result_code(code: i64) -> PaymentOutcome {
    if code == 0 {
        PaymentOutcome::Success
    } else if FAILURE_CODES.contains(&code) {
        PaymentOutcome::Failed
    } else if PENDING_CODES.contains(&code) {
        PaymentOutcome::Pending
    } else {
        PaymentOutcome::Unknown
    }
}

/// Optional result code as carried by redirect completion signals.
pub fn decode_optional_code(code: Option<i64>) -> PaymentOutcome {
    code.map(decode_result_code).unwrap_or(PaymentOutcome::Unknown)
}

/// Order status seen from the payment side. Used by the poller's order fallback;
/// the reconciler checks `OrderStatus::is_paid` directly.
pub fn decode_order_status(status: OrderStatus) -> PaymentOutcome {
    if status.is_paid() {
        PaymentOutcome::Success
    } else if status.is_dead() {
        PaymentOutcome::Failed
    } else {
        PaymentOutcome::Pending
    }
}

fn decode_value(value: &Value, depth: usize) -> PaymentOutcome {
    match value {
        Value::String(s) => decode_status_str(s),
        Value::Number(n) => n.as_i64().map(decode_result_code).unwrap_or(PaymentOutcome::Unknown),
        Value::Object(map) => {
            let status = first_field(map, STATUS_FIELDS)
                .filter(|v| v.is_string())
                .map(|v| decode_value(v, depth + 1))
                .unwrap_or(PaymentOutcome::Unknown);
            let code = first_field(map, CODE_FIELDS)
                .filter(|v| v.is_number() || v.is_string())
                .map(|v| decode_value(v, depth + 1))
                .unwrap_or(PaymentOutcome::Unknown);
            let direct = combine(status, code);
            if direct != PaymentOutcome::Unknown || depth >= MAX_DEPTH {
                return direct;
            }
            first_field(map, ENVELOPE_FIELDS)
                .filter(|v| v.is_object())
                .map(|v| decode_value(v, depth + 1))
                .unwrap_or(PaymentOutcome::Unknown)
        }
        Value::Null | Value::Bool(_) | Value::Array(_) => PaymentOutcome::Unknown,
    }
}

fn first_field<'a>(map: &'a serde_json::Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names.iter().find_map(|name| map.get(*name))
}

/// Merge a status word and a result code from the same payload level.
fn combine(a: PaymentOutcome, b: PaymentOutcome) -> PaymentOutcome {
    use PaymentOutcome::*;
    match (a, b) {
        (x, Unknown) | (Unknown, x) => x,
        (x, y) if x == y => x,
        // A contradiction between word and code is never read as success.
        (Success, Failed) | (Failed, Success) => Unknown,
        (Success, Pending) | (Pending, Success) => Pending,
        (Pending, Failed) | (Failed, Pending) => Failed,
        _ => Unknown,
    }
}
