//! HTTP API tests driving the router in-process.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use docflow::queue::{JobQueue, QueueOptions};
use docflow::server::{router, AppState};
use docflow_core::models::{trace_names, TraceEvent};

async fn setup() -> (TempDir, JobQueue, Router) {
    let tmp = TempDir::new().unwrap();
    let pool = docflow::db::open(&tmp.path().join("api.sqlite")).await.unwrap();
    docflow::migrate::apply(&pool).await.unwrap();
    let queue = JobQueue::new(pool, QueueOptions::default());
    let app = router(AppState::new(queue.clone()));
    (tmp, queue, app)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn new_job_body(name: &str) -> Value {
    json!({
        "job_type": "pdf",
        "correlation": {
            "source": { "item_id": format!("papers/{}", name), "parent_id": "papers", "name": name },
            "options": { "target_language": "de", "use_cache": true }
        },
        "batch_id": "spring"
    })
}

async fn enqueue(app: &Router, name: &str) -> String {
    let (status, body) = send(app, post_json("/jobs", new_job_body(name))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_version() {
    let (_tmp, _queue, app) = setup().await;
    let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn enqueue_then_fetch_and_count() {
    let (_tmp, _queue, app) = setup().await;
    let id = enqueue(&app, "a.pdf").await;

    let (status, body) = send(&app, Request::get(format!("/jobs/{}", id)).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");

    let (status, body) = send(&app, Request::get("/jobs/counters").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queued"], 1);
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let (_tmp, _queue, app) = setup().await;
    let (status, body) = send(&app, Request::get("/jobs/nope").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn malformed_enqueue_is_bad_request() {
    let (_tmp, _queue, app) = setup().await;
    let (status, body) = send(&app, post_json("/jobs", json!({ "job_type": "pdf" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn bulk_restart_without_confirm_touches_nothing() {
    let (_tmp, queue, app) = setup().await;
    let id = enqueue(&app, "a.pdf").await;
    let claim = queue.claim().await.unwrap().unwrap();
    queue.complete(&id, Some(claim.process_id()), None).await.unwrap();

    let (status, body) = send(
        &app,
        post_json("/jobs/restart", json!({ "filter": { "batch_id": "spring" } })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");
    assert_eq!(queue.get(&id).await.unwrap().unwrap().status.as_str(), "completed");

    let (status, body) = send(
        &app,
        post_json("/jobs/restart", json!({ "filter": { "batch_id": "spring" }, "confirm": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["restarted"], 1);
    assert_eq!(body["batches"], json!(["spring"]));
}

#[tokio::test]
async fn start_inside_dispatch_window_conflicts() {
    let (_tmp, queue, app) = setup().await;
    let id = enqueue(&app, "a.pdf").await;
    queue
        .append_trace(
            &id,
            &TraceEvent::new(
                trace_names::REQUEST_ACKNOWLEDGED,
                json!({ "phase": "extract", "provider": "http" }),
            ),
        )
        .await
        .unwrap();

    let (status, body) = send(&app, post_json(&format!("/jobs/{}/start", id), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_started");

    let (status, body) = send(&app, post_json(&format!("/jobs/{}/start?force=true", id), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
}

#[tokio::test]
async fn start_refuses_live_lease() {
    let (_tmp, queue, app) = setup().await;
    let id = enqueue(&app, "a.pdf").await;
    queue.claim().await.unwrap().unwrap();

    let (status, _) = send(&app, post_json(&format!("/jobs/{}/start", id), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn callback_requires_matching_secret() {
    let (_tmp, queue, app) = setup().await;
    let id = enqueue(&app, "a.pdf").await;
    let claim = queue.claim().await.unwrap().unwrap();
    let (secret, hash) = docflow::callback::new_secret();
    queue.set_callback_secret(&id, claim.process_id(), &hash).await.unwrap();

    let uri = format!("/jobs/{}/callback", id);
    let payload = json!({ "status": "completed", "markdown": "Body" });

    let (status, body) = send(&app, post_json(&uri, payload.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthorized");

    let wrong = Request::post(&uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, "Bearer not-the-secret")
        .body(Body::from(payload.to_string()))
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let right = Request::post(&uri)
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::AUTHORIZATION, format!("Bearer {}", secret))
        .body(Body::from(payload.to_string()))
        .unwrap();
    let (status, body) = send(&app, right).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "accepted");

    let job = queue.get(&id).await.unwrap().unwrap();
    assert!(job.latest_trace(trace_names::CALLBACK_RECEIVED).is_some());
}
