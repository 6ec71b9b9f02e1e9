//! Response helpers for the table endpoints.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::Value;

/// Bare JSON array of rows or entities.
pub fn rows(status: StatusCode, rows: Vec<Value>) -> Response {
    (status, Json(Value::Array(rows))).into_response()
}

/// Bare scalar count.
pub fn count(n: u64) -> Response {
    Json(n).into_response()
}

/// Mutations without `return`.
pub fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}
