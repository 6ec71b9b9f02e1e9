//! Table routes: `/{table}` and `/{table}/{option}` for every method.

use crate::extractors::attach_principal;
use crate::handlers::endpoint::{table_endpoint, table_option_endpoint};
use crate::state::AppState;
use axum::{middleware, routing::any, Router};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};

pub fn table_routes(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .route("/:table", any(table_endpoint))
        .route("/:table/:option", any(table_option_endpoint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(attach_principal))
                .layer(RequestBodyLimitLayer::new(body_limit)),
        )
        .with_state(state)
}
