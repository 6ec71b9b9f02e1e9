//! The `/{table}[/{option}]` endpoint: one handler for every table and method.

use crate::catalog::TableDescriptor;
use crate::error::AppError;
use crate::extractors::Principal;
use crate::notifier::change_stream;
use crate::query::{Filter, QueryParams, ReadPlan};
use crate::response;
use crate::service::{BodyItem, CrudService, RequestValidator, WriteMode};
use crate::state::AppState;
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{Method, StatusCode},
    response::{sse::Sse, IntoResponse, Response},
    Json,
};
use serde_json::Value;

pub const COUNT: &str = "count";
pub const STREAM: &str = "stream";
pub const RETURN: &str = "return";

pub async fn table_endpoint(
    State(state): State<AppState>,
    Path(route): Path<String>,
    principal: Principal,
    method: Method,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, AppError> {
    dispatch(&state, &route, None, &principal, method, pairs, body).await
}

pub async fn table_option_endpoint(
    State(state): State<AppState>,
    Path((route, option)): Path<(String, String)>,
    principal: Principal,
    method: Method,
    Query(pairs): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, AppError> {
    dispatch(&state, &route, Some(option), &principal, method, pairs, body).await
}

async fn dispatch(
    state: &AppState,
    route: &str,
    path_option: Option<String>,
    principal: &Principal,
    method: Method,
    pairs: Vec<(String, String)>,
    body: Bytes,
) -> Result<Response, AppError> {
    let table = state.catalog.resolve(route)?;
    let params = QueryParams::from_pairs(pairs);
    let option = path_option
        .map(|o| o.trim().to_lowercase())
        .or_else(|| params.option().map(str::to_string));
    let option = option.as_deref();
    tracing::debug!(table = %table.name, %method, ?option, principal = principal.name(), "dispatch");

    match method {
        Method::GET => read(state, table, &params, option).await,
        Method::POST => {
            let returning = returning(&method, table, option)?;
            let mode = WriteMode::Create {
                nested: state.nested_writes,
            };
            let items = body_items(state, table, &body, mode)?;
            let created = CrudService::create(&state.db, &state.catalog, table, &items).await?;
            Ok(if returning {
                response::rows(StatusCode::CREATED, created)
            } else {
                response::no_content()
            })
        }
        Method::PUT => {
            let returning = returning(&method, table, option)?;
            let items = body_items(state, table, &body, WriteMode::Replace)?;
            let filter = Filter::compile_strict(&state.catalog, table, &params)?;
            let replaced = CrudService::replace(&state.db, table, &filter, &items).await?;
            Ok(if returning {
                response::rows(StatusCode::OK, replaced)
            } else {
                response::no_content()
            })
        }
        Method::DELETE => {
            let returning = returning(&method, table, option)?;
            let filter = Filter::compile_strict(&state.catalog, table, &params)?;
            let deleted = CrudService::delete(&state.db, table, &filter).await?;
            Ok(if returning {
                response::rows(StatusCode::OK, deleted)
            } else {
                response::no_content()
            })
        }
        other => Err(AppError::NotAcceptable(format!("{} /{}", other, table.name))),
    }
}

async fn read(
    state: &AppState,
    table: &TableDescriptor,
    params: &QueryParams,
    option: Option<&str>,
) -> Result<Response, AppError> {
    match option {
        None => {
            let plan = ReadPlan::compile(&state.catalog, table, params)?;
            let rows = CrudService::read(&state.db, &state.catalog, table, &plan).await?;
            Ok(Json(rows).into_response())
        }
        Some(COUNT) => {
            let plan = ReadPlan::compile(&state.catalog, table, params)?;
            let n = CrudService::count(&state.db, table, &plan).await?;
            Ok(response::count(n))
        }
        Some(STREAM) => {
            let filter = Filter::compile(&state.catalog, table, params)?;
            let subscription = state.notifier.subscribe(table, filter)?;
            tracing::debug!(table = %table.name, id = subscription.id(), "stream opened");
            Ok(Sse::new(change_stream(subscription, state.heartbeat)).into_response())
        }
        Some(other) => Err(not_acceptable(&Method::GET, table, other)),
    }
}

fn returning(method: &Method, table: &TableDescriptor, option: Option<&str>) -> Result<bool, AppError> {
    match option {
        None => Ok(false),
        Some(RETURN) => Ok(true),
        Some(other) => Err(not_acceptable(method, table, other)),
    }
}

fn not_acceptable(method: &Method, table: &TableDescriptor, option: &str) -> AppError {
    AppError::NotAcceptable(format!("option \"{}\" for {} /{}", option, method, table.name))
}

/// Parse and narrow a write body. Empty bodies (including `{}` and `[]`) are not modifications.
fn body_items(state: &AppState, table: &TableDescriptor, body: &Bytes, mode: WriteMode) -> Result<Vec<BodyItem>, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(AppError::EmptyBody);
    }
    let value: Value = serde_json::from_slice(body).map_err(|_| AppError::BadRequest("Body is invalid.".into()))?;
    let empty = match &value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    };
    if empty {
        return Err(AppError::EmptyBody);
    }
    RequestValidator::objects(&table.name, value)?
        .iter()
        .map(|object| RequestValidator::narrow(&state.catalog, table, object, mode, None))
        .collect()
}
