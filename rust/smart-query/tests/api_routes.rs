//! HTTP surface tests driven through the router without a socket.

mod common;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use common::{MockDatabase, ScriptedLlm, orchestrator, test_config};
use smart_query::AppState;
use smart_query::server::build_router;

fn app(sql: &str) -> (Router, Arc<MockDatabase>, Arc<ScriptedLlm>) {
    let config = test_config();
    let db = Arc::new(MockDatabase::new());
    let llm = Arc::new(ScriptedLlm::answering(sql));
    let pipeline = orchestrator(config.clone(), &db, &llm);
    (build_router(AppState::new(config, pipeline)), db, llm)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            request = request.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let (app, _, _) = app("SELECT 1");
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_ready_after_refresh() {
    let (app, _, _) = app("SELECT 1");

    let (status, body) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "not_ready");

    let (status, body) = send(&app, Method::POST, "/api/embed-schema", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revision"], 1);
    assert_eq!(body["tables"], 3);
    assert_eq!(body["index_revision"], 1);

    let (status, body) = send(&app, Method::GET, "/ready", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["schema_revision"], 1);
}

#[tokio::test]
async fn test_smart_query_success() {
    let (app, db, _) = app("SELECT name, revenue FROM customers ORDER BY revenue DESC LIMIT 10");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smart-query",
        Some(json!({ "query": "top 10 customers by revenue" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["stage"], "completed");
    assert_eq!(body["row_count"], 2);
    assert_eq!(body["columns"], json!(["name", "revenue"]));
    assert!(body.get("error").is_none());
    assert_eq!(db.executed().len(), 1);
}

#[tokio::test]
async fn test_smart_query_blank_question() {
    let (app, _, llm) = app("SELECT 1");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smart-query",
        Some(json!({ "query": "   " })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["reason_code"], "InvalidQuestion");
    assert_eq!(body["error"]["stage"], "received");
    assert_eq!(llm.calls(), 0);
}

#[tokio::test]
async fn test_smart_query_rejection() {
    let (app, _, _) = app("SELECT * FROM invoices");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/smart-query",
        Some(json!({ "query": "list all invoices" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["reason_code"], "UnknownIdentifier");
    assert_eq!(body["error"]["stage"], "validating");
    assert_eq!(body["error"]["identifiers"], json!(["invoices"]));
    assert_eq!(body["attempts"], 2);
}

#[tokio::test]
async fn test_generate_sql() {
    let (app, db, _) = app("SELECT name FROM customers");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/generate-sql",
        Some(json!({ "query": "customer names" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sql"], "SELECT name FROM customers LIMIT 1000");
    assert!(body.get("rows").is_none());
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_execute_query_rejects_writes() {
    let (app, db, _) = app("SELECT 1");

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/query",
        Some(json!({ "sql": "DROP TABLE customers" })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["reason_code"], "DisallowedStatement");
    assert!(db.executed().is_empty());
}

#[tokio::test]
async fn test_tables_before_and_after_refresh() {
    let (app, _, _) = app("SELECT 1");

    let (status, body) = send(&app, Method::GET, "/api/tables", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason_code"], "SchemaUnavailable");

    send(&app, Method::POST, "/api/embed-schema", None).await;

    let (status, body) = send(&app, Method::GET, "/api/tables", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revision"], 1);
    let names: Vec<&str> = body["tables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["customers", "orders", "products"]);
    assert_eq!(body["tables"][0]["row_count"], 1200);

    let (status, body) = send(&app, Method::GET, "/api/schema", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_object());
}

#[tokio::test]
async fn test_single_table_schema() {
    let (app, _, _) = app("SELECT 1");

    let (status, body) = send(&app, Method::GET, "/api/schema/orders", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason_code"], "SchemaUnavailable");

    send(&app, Method::POST, "/api/embed-schema", None).await;

    let (status, body) = send(&app, Method::GET, "/api/schema/orders", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "orders");
    assert_eq!(body["row_count"], 50_000);
    assert_eq!(body["columns"].as_array().unwrap().len(), 5);
    assert_eq!(body["relationships"][0]["from_column"], "customer_id");
    assert_eq!(body["relationships"][0]["to_table"], "customers");

    let (status, body) = send(&app, Method::GET, "/api/schema/invoices", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason_code"], "UnknownIdentifier");
    assert_eq!(body["message"], "table invoices does not exist");
}

#[tokio::test]
async fn test_embed_schema_failure() {
    let config = test_config();
    let db = Arc::new(MockDatabase::new());
    db.fail_describe
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let llm = Arc::new(ScriptedLlm::answering("SELECT 1"));
    let app = build_router(AppState::new(config.clone(), orchestrator(config, &db, &llm)));

    let (status, body) = send(&app, Method::POST, "/api/embed-schema", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["reason_code"], "SchemaUnavailable");
    assert_eq!(body["message"], "database schema is unavailable");
}
