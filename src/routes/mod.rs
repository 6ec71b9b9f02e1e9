//! Router assembly.

pub mod common;
pub mod table;

pub use common::common_routes;
pub use table::table_routes;

use crate::state::AppState;
use axum::Router;

pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// Operational routes plus the table routes. Static paths win over `/{table}`.
pub fn app(state: AppState, body_limit: usize) -> Router {
    Router::new()
        .merge(common_routes(state.clone()))
        .merge(table_routes(state, body_limit))
}
