//! Typed errors and HTTP mapping.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing reference: {kind} '{id}'")]
    MissingReference { kind: &'static str, id: String },
    #[error("table {table} has no primary key")]
    MissingPrimaryKey { table: String },
    #[error("duplicate {kind}: {name}")]
    Duplicate { kind: &'static str, name: String },
    #[error("could not infer type for {table}.{column}: {type_name}")]
    UnknownType {
        table: String,
        column: String,
        type_name: String,
    },
    #[error("config load: {0}")]
    Load(String),
    #[error("invalid setting {name}: {reason}")]
    Setting { name: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Route is not determined: {0}")]
    RouteNotFound(String),
    #[error("{0}")]
    SchemaMismatch(String),
    #[error("Value of parameter \"{parameter}\" is invalid: expected {expected}, got \"{value}\"")]
    ValueCoercion {
        parameter: String,
        expected: String,
        value: String,
    },
    #[error("Table \"{table}\" requires fields: {}", quoted_list(.fields))]
    MissingRequiredFields { table: String, fields: Vec<String> },
    #[error("Body is empty.")]
    EmptyBody,
    #[error("not implemented: {0}")]
    Unsupported(String),
    #[error("not acceptable: {0}")]
    NotAcceptable(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("internal: {0}")]
    Internal(String),
    #[error("database: {0}")]
    Db(sqlx::Error),
}

fn quoted_list(fields: &[String]) -> String {
    fields
        .iter()
        .map(|f| format!("\"{}\"", f))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        let violation = e
            .as_database_error()
            .map(|d| {
                d.is_unique_violation() || d.is_foreign_key_violation() || d.is_check_violation()
            })
            .unwrap_or(false);
        if violation {
            return AppError::Conflict(e.to_string());
        }
        AppError::Db(e)
    }
}

impl AppError {
    /// Machine-checkable error kind, also used as the `code` of the error body.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::RouteNotFound(_) => "route_not_found",
            AppError::SchemaMismatch(_) => "schema_mismatch",
            AppError::ValueCoercion { .. } => "value_coercion",
            AppError::MissingRequiredFields { .. } => "missing_required_fields",
            AppError::EmptyBody => "empty_body",
            AppError::Unsupported(_) => "not_implemented",
            AppError::NotAcceptable(_) => "not_acceptable",
            AppError::BadRequest(_) => "bad_request",
            AppError::Conflict(_) => "conflict",
            AppError::Internal(_) => "internal_error",
            AppError::Db(_) => "database_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RouteNotFound(_)
            | AppError::SchemaMismatch(_)
            | AppError::ValueCoercion { .. }
            | AppError::MissingRequiredFields { .. }
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::EmptyBody => StatusCode::NOT_MODIFIED,
            AppError::Unsupported(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Config(_) | AppError::Internal(_) | AppError::Db(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True for errors caused by the request rather than by the deployment.
    pub fn is_client_error(&self) -> bool {
        self.status().is_client_error() || matches!(self, AppError::EmptyBody)
    }
}

#[derive(Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.kind();
        if self.is_client_error() {
            tracing::debug!(code, error = %self, "request rejected");
        } else {
            tracing::error!(code, error = %self, "request failed");
        }
        // 304 carries no body.
        if let AppError::EmptyBody = self {
            let mut response = status.into_response();
            response
                .headers_mut()
                .insert("x-error-code", HeaderValue::from_static("empty_body"));
            return response;
        }
        let details = match &self {
            AppError::MissingRequiredFields { fields, .. } => Some(serde_json::json!({ "fields": fields })),
            AppError::ValueCoercion {
                parameter, expected, ..
            } => Some(serde_json::json!({ "parameter": parameter, "expected": expected })),
            _ => None,
        };
        let body = ErrorBody {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_the_request_ones() {
        assert!(AppError::EmptyBody.is_client_error());
        assert!(AppError::RouteNotFound("x".into()).is_client_error());
        assert!(AppError::Conflict("dup".into()).is_client_error());
        assert!(!AppError::Internal("boom".into()).is_client_error());
        assert_eq!(AppError::EmptyBody.status(), StatusCode::NOT_MODIFIED);
    }
}
