//! Admin API round trips through the axum router without a listener.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

use common::{payload, HarnessBuilder, ScriptedExecutor, TestHarness};
use provisioner::orchestration::StepResult;
use provisioner::web::{create_app, AppState};

fn app(h: &TestHarness) -> Router {
    create_app(AppState::new(h.core.clone()), Duration::from_secs(5))
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            request = request.header("content-type", "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app
        .clone()
        .oneshot(request.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_reports_store_state() {
    let h = HarnessBuilder::new().build().await;
    let app = app(&h);

    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"], "ok");

    h.store.set_available(false);
    let (status, body) = send(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");
}

#[tokio::test]
async fn test_paid_hook_creates_task_once() {
    let h = HarnessBuilder::new().build().await;
    let app = app(&h);

    let (status, task) = send(
        &app,
        Method::POST,
        "/v1/subscriptions/11/paid",
        Some(json!({"domain": "hook.test"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["subscription_id"], 11);
    assert_eq!(task["status"], "pending");

    let (status, body) = send(
        &app,
        Method::POST,
        "/v1/subscriptions/11/paid",
        Some(json!({"domain": "hook.test"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "CONFLICT");

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/subscriptions/12/paid",
        Some(json!(["not", "an", "object"])),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_task_listing_and_detail() {
    let h = HarnessBuilder::new()
        .with_executors(&[ScriptedExecutor::ok("create_vhost")])
        .build()
        .await;
    let app = app(&h);
    let done = h.paid(1, payload("done.test", &["create_vhost"])).await;
    h.drain().await;
    h.paid(2, payload("waiting.test", &["create_vhost"])).await;

    let (status, all) = send(&app, Method::GET, "/v1/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(all.as_array().unwrap().len(), 2);

    let (_, pending) = send(&app, Method::GET, "/v1/tasks?status=pending", None).await;
    let pending = pending.as_array().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0]["subscription_id"], 2);

    let (status, body) = send(&app, Method::GET, "/v1/tasks?status=sleeping", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");

    let (status, task) = send(&app, Method::GET, &format!("/v1/tasks/{}", done.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "success");
    assert_eq!(task["step"], "create_vhost");

    let (status, log) = send(
        &app,
        Method::GET,
        &format!("/v1/tasks/{}/transitions", done.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log[0]["event"], "task.created");
    assert_eq!(log.as_array().unwrap().last().unwrap()["to_status"], "success");

    let (status, body) = send(&app, Method::GET, "/v1/tasks/4040", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_retry_and_failed_jobs_endpoints() {
    let vhost = ScriptedExecutor::always("create_vhost", StepResult::transient("busy"), 6);
    let h = HarnessBuilder::new()
        .with_executors(&[vhost.clone()])
        .build()
        .await;
    let app = app(&h);
    let first = h.paid(1, payload("one.test", &["create_vhost"])).await;
    let second = h.paid(2, payload("two.test", &["create_vhost"])).await;

    // Pending tasks cannot be retried
    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/v1/tasks/{}/retry", first.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    for _ in 0..3 {
        h.drain().await;
        h.advance(Duration::from_secs(3600));
    }

    let (status, failed) = send(&app, Method::GET, "/v1/failed_jobs", None).await;
    assert_eq!(status, StatusCode::OK);
    let failed = failed.as_array().unwrap();
    assert_eq!(failed.len(), 2);
    assert!(failed.iter().all(|record| record["attempts"] == 3));

    // The scripted failures are used up, so the admin retry succeeds
    let (status, retried) = send(
        &app,
        Method::POST,
        &format!("/v1/tasks/{}/retry", first.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(retried["status"], "pending");
    assert_eq!(retried["attempts"], 0);
    h.drain().await;
    assert_eq!(h.task(first.id).await.status, provisioner::TaskStatus::Success);

    let (status, cleared) = send(
        &app,
        Method::DELETE,
        &format!("/v1/failed_jobs?task_id={}", second.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared["count"], 1);
    assert_eq!(cleared["cleared"][0]["task_id"], second.id);

    let (status, body) = send(
        &app,
        Method::DELETE,
        &format!("/v1/failed_jobs?task_id={}", second.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn test_manual_provision_endpoint() {
    let h = HarnessBuilder::new().build().await;
    let app = app(&h);

    let request = json!({
        "subscription_id": 31,
        "customer_id": 4,
        "product_id": 9,
        "domain": "manual.test",
        "payload": {"features": ["mailbox"]}
    });
    let (status, task) = send(&app, Method::POST, "/v1/provision", Some(request.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(task["payload"]["domain"], "manual.test");
    assert_eq!(task["payload"]["features"], json!(["mailbox"]));

    let (status, _) = send(&app, Method::POST, "/v1/provision", Some(request)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(
        &app,
        Method::POST,
        "/v1/provision",
        Some(json!({"subscription_id": 32, "customer_id": 1, "product_id": 1, "domain": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_stats_servers_and_cancel_hook() {
    let h = HarnessBuilder::new().build().await;
    let app = app(&h);
    h.paid(1, json!({"domain": "a.test"})).await;
    h.paid(2, json!({"domain": "b.test"})).await;

    let (status, stats) = send(&app, Method::GET, "/v1/stats?window=7", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["window_days"], 7);
    assert_eq!(stats["pending"], 2);
    assert_eq!(stats["failed"], 0);

    let (status, _) = send(&app, Method::GET, "/v1/stats?window=0", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, servers) = send(&app, Method::GET, "/v1/servers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(servers[0]["name"], "web-01");
    assert_eq!(servers[0]["current_accounts"], 0);

    let (status, task) = send(&app, Method::POST, "/v1/subscriptions/2/cancelled", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["status"], "failed");
    assert_eq!(task["error_message"], "cancelled");

    let (status, none) = send(&app, Method::POST, "/v1/subscriptions/99/cancelled", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(none.is_null());

    let (_, stats) = send(&app, Method::GET, "/v1/stats", None).await;
    assert_eq!(stats["pending"], 1);
    assert_eq!(stats["failed"], 1);
}
