//! HTTP trigger surface, driven in-process through the router.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use course_harness::config::Config;
use course_harness::enrichment::DisabledService;
use course_harness::pipeline::Pipeline;
use course_harness::server::router;
use course_harness_core::models::{fields, FieldMap};
use course_harness_core::store::memory::InMemoryStore;

fn app(configure: impl FnOnce(&mut Config)) -> Router {
    let store = InMemoryStore::new();
    let mut course = FieldMap::new();
    course.insert(fields::TITLE.into(), "Rust programming".into());
    store.insert_collection("rust", course).unwrap();

    let mut config = Config::minimal();
    configure(&mut config);
    router(Arc::new(Pipeline::new(
        config,
        Arc::new(store),
        Arc::new(DisabledService),
    )))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-client-id", "tests")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn health_reports_warning_with_disabled_service() {
    let (status, body) = send(app(|_| {}), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "warning");
    assert_eq!(body["checks"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn plans_lists_builtin_plans() {
    let (status, body) = send(app(|_| {}), get("/plans")).await;
    assert_eq!(status, StatusCode::OK);
    let names: Vec<_> = body["plans"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["course-category", "question-topic"]);
    assert_eq!(body["plans"][0]["estimated_item_count"], 1);
}

#[tokio::test]
async fn scope_counts_collections() {
    let (status, body) = send(app(|_| {}), get("/scope")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_collections"], 1);
    assert_eq!(body["total_records"], 0);
}

#[tokio::test]
async fn migrate_runs_plan_and_returns_result() {
    let (status, body) = send(
        app(|_| {}),
        post("/runs/migrate/course-category", r#"{"backup_first": false}"#),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");
    assert_eq!(body["success"], 1);
    assert!(body["backup_id"].is_null());
}

#[tokio::test]
async fn migrate_with_empty_body_takes_backup() {
    let (status, body) = send(app(|_| {}), post("/runs/migrate/course-category", "")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["backup_id"].is_string());
}

#[tokio::test]
async fn unknown_plan_is_not_found() {
    let (status, body) = send(app(|_| {}), post("/runs/migrate/drop-everything", "{}")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("drop-everything"));
}

#[tokio::test]
async fn unknown_collection_is_not_found() {
    let (status, body) = send(
        app(|_| {}),
        post("/runs/enhance", r#"{"collection": "nope"}"#),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn malformed_body_is_bad_request() {
    let (status, body) = send(app(|_| {}), post("/runs/enhance", "{not json")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn run_requests_are_rate_limited_per_client() {
    let app = app(|c| c.server.admission_limit = 1);

    let (first, _) = send(app.clone(), post("/runs/cancel", "")).await;
    assert_eq!(first, StatusCode::ACCEPTED);

    let (second, body) = send(app.clone(), post("/runs/cancel", "")).await;
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "rate_limited");

    // a different client has its own budget
    let other = Request::builder()
        .method("POST")
        .uri("/runs/cancel")
        .header("x-client-id", "someone-else")
        .body(Body::empty())
        .unwrap();
    let (third, _) = send(app, other).await;
    assert_eq!(third, StatusCode::ACCEPTED);
}
