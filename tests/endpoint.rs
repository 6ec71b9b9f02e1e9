mod common;

use axum::body::Body;
use axum::http::StatusCode;
use common::{router, send, send_raw, state};
use serde_json::json;

fn names(rows: &serde_json::Value) -> Vec<&str> {
    rows.as_array().unwrap().iter().map(|r| r["name"].as_str().unwrap()).collect()
}

async fn seed(app: &axum::Router) {
    let reply = send(
        app,
        "POST",
        "/bonuses",
        Some(json!([
            {"name": "Alpha", "active": true, "amount": 10},
            {"name": "Beta", "active": false, "amount": 20.5},
            {"name": "Gamma", "active": true}
        ])),
    )
    .await;
    assert_eq!(reply.status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn create_read_delete_round_trip() {
    let app = router(state());

    let created = send(&app, "POST", "/bonuses/return", Some(json!({"name": "X"}))).await;
    assert_eq!(created.status, StatusCode::CREATED);
    assert!(created.headers.contains_key("x-request-id"));
    let elapsed: f64 = created.headers["x-process-time"].to_str().unwrap().parse().unwrap();
    assert!(elapsed >= 0.0);
    assert_eq!(created.body[0]["active"], json!(true));
    let id = created.body[0]["id"].clone();

    let read = send(&app, "GET", &format!("/bonuses?id={}", id), None).await;
    assert_eq!(read.status, StatusCode::OK);
    assert_eq!(read.body, created.body);

    let by_name = send(&app, "GET", "/bonuses?name=X", None).await;
    assert_eq!(by_name.body.as_array().map(Vec::len), Some(1));

    let deleted = send(&app, "DELETE", "/bonuses?name=X", None).await;
    assert_eq!(deleted.status, StatusCode::NO_CONTENT);
    let after = send(&app, "GET", "/bonuses?name=X", None).await;
    assert_eq!(after.body, json!([]));
}

#[tokio::test]
async fn filters_on_distinct_columns_are_ored() {
    let app = router(state());
    seed(&app).await;

    let reply = send(&app, "GET", "/bonuses?name=alpha&active=false", None).await;
    assert_eq!(names(&reply.body), vec!["Alpha", "Beta"]);

    let repeated = send(&app, "GET", "/bonuses?name=alpha&name=gamma", None).await;
    assert_eq!(repeated.body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn operators_and_ordering() {
    let app = router(state());
    seed(&app).await;

    let reply = send(&app, "GET", "/bonuses?amount=%3E%3D15", None).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body.as_array().unwrap().len(), 1);
    assert_eq!(reply.body[0]["name"], json!("Beta"));
    assert_eq!(reply.body[0]["amount"], json!("20.5"));

    let below = send(&app, "GET", "/bonuses?amount=%3C15", None).await;
    assert_eq!(names(&below.body), vec!["Alpha"]);

    let not_beta = send(&app, "GET", "/bonuses?name=!beta", None).await;
    assert_eq!(names(&not_beta.body), vec!["Alpha", "Gamma"]);

    let nulls = send(&app, "GET", "/bonuses?amount=", None).await;
    assert_eq!(nulls.body.as_array().unwrap().len(), 1);
    assert_eq!(nulls.body[0]["name"], json!("Gamma"));

    let glob = send(&app, "GET", "/bonuses?name=~*MMA", None).await;
    assert_eq!(glob.body[0]["name"], json!("Gamma"));

    let ordered = send(&app, "GET", "/bonuses?desc=name&limit=2&offset=1", None).await;
    assert_eq!(names(&ordered.body), vec!["Beta", "Alpha"]);
}

#[tokio::test]
async fn count_matches_read_length() {
    let app = router(state());
    seed(&app).await;

    for query in ["", "?active=true", "?name=beta&amount=10", "?name=nobody", "?limit=1"] {
        let rows = send(&app, "GET", &format!("/bonuses{}", query), None).await;
        let sep = if query.is_empty() { "?" } else { "&" };
        let count = send(&app, "GET", &format!("/bonuses{}{}option=count", query, sep), None).await;
        assert_eq!(count.body, json!(rows.body.as_array().unwrap().len()), "query {query}");
    }
    let path_option = send(&app, "GET", "/bonuses/count?active=true", None).await;
    assert_eq!(path_option.body, json!(2));
}

#[tokio::test]
async fn filtered_delete_removes_only_matches() {
    let app = router(state());
    seed(&app).await;

    let deleted = send(&app, "DELETE", "/bonuses/return?active=false", None).await;
    assert_eq!(deleted.status, StatusCode::OK);
    assert_eq!(deleted.body[0]["name"], json!("Beta"));

    let gone = send(&app, "GET", "/bonuses?active=false", None).await;
    assert_eq!(gone.body, json!([]));
    let rest = send(&app, "GET", "/bonuses/count", None).await;
    assert_eq!(rest.body, json!(2));
}

#[tokio::test]
async fn write_filters_reject_unknown_keys() {
    let app = router(state());
    seed(&app).await;

    let typo = send(&app, "DELETE", "/bonuses?nmae=alpha", None).await;
    assert_eq!(typo.status, StatusCode::BAD_REQUEST);
    assert_eq!(typo.body["error"]["code"], json!("schema_mismatch"));
    assert_eq!(typo.body["error"]["message"], json!("Field \"nmae\" is not present in Bonuses."));

    let relationship = send(&app, "DELETE", "/bonuses?owner=1", None).await;
    assert_eq!(relationship.status, StatusCode::BAD_REQUEST);

    let put = send(&app, "PUT", "/bonuses?nmae=alpha", Some(json!({"name": "zzz"}))).await;
    assert_eq!(put.status, StatusCode::BAD_REQUEST);

    let rest = send(&app, "GET", "/bonuses/count", None).await;
    assert_eq!(rest.body, json!(3));
    let inserted = send(&app, "GET", "/bonuses?name=zzz", None).await;
    assert_eq!(inserted.body, json!([]));

    // Reads stay lenient.
    let read = send(&app, "GET", "/bonuses?nmae=alpha", None).await;
    assert_eq!(read.body.as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn filtered_put_updates_every_match() {
    let app = router(state());
    seed(&app).await;

    let reply = send(&app, "PUT", "/bonuses/return?active=true", Some(json!({"amount": 1}))).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body.as_array().unwrap().len(), 2);

    let ones = send(&app, "GET", "/bonuses?amount=1", None).await;
    assert_eq!(ones.body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn repeated_reads_are_identical() {
    let app = router(state());
    seed(&app).await;
    let first = send(&app, "GET", "/bonuses?active=true&asc=name", None).await;
    let second = send(&app, "GET", "/bonuses?active=true&asc=name", None).await;
    assert_eq!(first.body, second.body);
}

#[tokio::test]
async fn eager_loads_and_column_projections() {
    let app = router(state().with_nested_writes(true));
    let created = send(
        &app,
        "POST",
        "/owners/return",
        Some(json!({"name": "Olive", "bonuses": [{"name": "one"}, {"name": "two"}]})),
    )
    .await;
    assert_eq!(created.status, StatusCode::CREATED);

    let owners = send(&app, "GET", "/owners?field=bonuses", None).await;
    let bonuses = owners.body[0]["bonuses"].as_array().unwrap();
    assert_eq!(bonuses.len(), 2);
    assert!(bonuses[0].get("owner").is_none());

    let projected = send(&app, "GET", "/bonuses?field=name&field=owner.name", None).await;
    assert_eq!(projected.body[0], json!({"name": "one", "owner.name": "Olive"}));
}

#[tokio::test]
async fn boundary_errors() {
    let app = router(state());

    let empty = send_raw(&app, "POST", "/bonuses", Body::empty()).await;
    assert_eq!(empty.status, StatusCode::NOT_MODIFIED);
    assert_eq!(empty.headers["x-error-code"], "empty_body");
    let empty_object = send(&app, "POST", "/bonuses", Some(json!({}))).await;
    assert_eq!(empty_object.status, StatusCode::NOT_MODIFIED);

    let missing = send(&app, "POST", "/bonuses", Some(json!({"active": false}))).await;
    assert_eq!(missing.status, StatusCode::BAD_REQUEST);
    assert_eq!(missing.body["error"]["code"], json!("missing_required_fields"));
    assert_eq!(missing.body["error"]["details"]["fields"], json!(["name"]));

    let route = send(&app, "GET", "/nowhere", None).await;
    assert_eq!(route.status, StatusCode::BAD_REQUEST);
    assert_eq!(route.body["error"]["message"], json!("Route is not determined: nowhere"));

    let field = send(&app, "GET", "/bonuses?field=owner.nope", None).await;
    assert_eq!(field.status, StatusCode::BAD_REQUEST);
    assert_eq!(field.body["error"]["message"], json!("Field \"nope\" is not present in Bonuses.owner."));

    let coercion = send(&app, "GET", "/bonuses?active=maybe", None).await;
    assert_eq!(coercion.body["error"]["code"], json!("value_coercion"));
    assert_eq!(coercion.body["error"]["details"]["parameter"], json!("active"));

    let limit = send(&app, "GET", "/bonuses?limit=ten", None).await;
    assert_eq!(limit.status, StatusCode::BAD_REQUEST);

    let invalid = send_raw(&app, "POST", "/bonuses", Body::from("{not json")).await;
    assert_eq!(invalid.body["error"]["message"], json!("bad request: Body is invalid."));
}

#[tokio::test]
async fn unsupported_and_unacceptable_requests() {
    let app = router(state());

    let nested = send(&app, "POST", "/bonuses", Some(json!({"name": "n", "owner": {"name": "o"}}))).await;
    assert_eq!(nested.status, StatusCode::NOT_IMPLEMENTED);

    let option = send(&app, "GET", "/bonuses/return", None).await;
    assert_eq!(option.status, StatusCode::NOT_ACCEPTABLE);

    let method = send(&app, "PATCH", "/bonuses", Some(json!({"name": "n"}))).await;
    assert_eq!(method.status, StatusCode::NOT_ACCEPTABLE);

    let unknown_key = send(&app, "POST", "/bonuses", Some(json!({"name": "n", "colour": "red"}))).await;
    assert_eq!(unknown_key.body["error"]["code"], json!("schema_mismatch"));
}

#[tokio::test]
async fn operational_routes() {
    let app = router(state());
    let health = send(&app, "GET", "/health", None).await;
    assert_eq!(health.body, json!({"status": "ok"}));
    let ready = send(&app, "GET", "/ready", None).await;
    assert_eq!(ready.body, json!({"status": "ok", "store": "memory"}));
    let info = send(&app, "GET", "/info", None).await;
    assert_eq!(info.body["tables"], json!(["Bonuses", "owners"]));
}
