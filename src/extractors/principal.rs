//! Per-request principal. The middleware attaches it; handlers receive it but the
//! engine does not act on it.

use crate::error::AppError;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request},
    http::{header::AUTHORIZATION, request::Parts, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use std::time::Instant;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");
/// Seconds spent handling the request, as a decimal string.
pub const PROCESS_TIME_HEADER: HeaderName = HeaderName::from_static("x-process-time");

/// Identity of the caller: the bearer token subject, if any.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Principal(pub Option<String>);

impl Principal {
    pub fn name(&self) -> &str {
        self.0.as_deref().unwrap_or("anonymous")
    }
}

/// Attach a [`Principal`] from the `Authorization: Bearer` header, then tag the
/// response with a request id and its processing time.
pub async fn attach_principal(mut request: Request, next: Next) -> Response {
    let started = Instant::now();
    let subject = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    request.extensions_mut().insert(Principal(subject));

    let request_id = Uuid::new_v4();
    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    let elapsed = format!("{:.6}", started.elapsed().as_secs_f64());
    if let Ok(value) = HeaderValue::from_str(&elapsed) {
        response.headers_mut().insert(PROCESS_TIME_HEADER, value);
    }
    response
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    /// A missing principal means the middleware was not wired.
    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .cloned()
            .ok_or_else(|| AppError::Internal("Principal is not present.".into()))
    }
}
