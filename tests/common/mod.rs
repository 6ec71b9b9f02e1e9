#![allow(dead_code)]

use axum::{
    body::{to_bytes, Body},
    http::{HeaderMap, Request, StatusCode},
    Router,
};
use crudstream::{app, resolve, AppState, Catalog, CatalogConfig, MemoryStore};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

pub fn catalog() -> Arc<Catalog> {
    let config: CatalogConfig = serde_json::from_value(json!({
        "tables": [
            {
                "name": "Bonuses",
                "columns": [
                    { "key": "id", "type": "serial", "primary_key": true },
                    { "key": "name", "type": "text", "nullable": false },
                    { "key": "active", "type": "boolean", "nullable": false, "default": true },
                    { "key": "amount", "type": "numeric" },
                    { "key": "owner_id", "type": "integer" }
                ],
                "relationships": [
                    { "key": "owner", "target": "owners", "cardinality": "one",
                      "local_column": "owner_id", "remote_column": "id", "back_populates": "bonuses" }
                ]
            },
            {
                "name": "owners",
                "columns": [
                    { "key": "id", "type": "serial", "primary_key": true },
                    { "key": "name", "type": "text", "nullable": false }
                ],
                "relationships": [
                    { "key": "bonuses", "target": "Bonuses", "cardinality": "many",
                      "local_column": "id", "remote_column": "owner_id", "back_populates": "owner" }
                ]
            }
        ]
    }))
    .expect("fixture config");
    Arc::new(resolve(&config).expect("fixture catalog"))
}

pub fn state() -> AppState {
    let catalog = catalog();
    let store = Arc::new(MemoryStore::new(catalog.clone()));
    AppState::new(catalog, store).with_heartbeat(Duration::from_millis(50))
}

pub fn router(state: AppState) -> Router {
    app(state, 64 * 1024)
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

pub async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> Reply {
    let body = match body {
        Some(v) => Body::from(v.to_string()),
        None => Body::empty(),
    };
    send_raw(app, method, uri, body).await
}

pub async fn send_raw(app: &Router, method: &str, uri: &str, body: Body) -> Reply {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("infallible router");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    Reply { status, headers, body }
}
