//! HTTP API tests driven through the router without a socket.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures::StreamExt;
use hotreel::api::router;
use hotreel::api::state::AppState;
use hotreel::scheduler::{RunParameters, Scheduler};
use serde_json::{json, Value};
use tower::ServiceExt;

use common::{next_completion, scheduler, GatedWorker};

fn app(scheduler: &Scheduler) -> axum::Router {
    router(AppState::new(scheduler.clone(), 5))
}

async fn send(app: axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header(header::CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

#[tokio::test]
async fn test_health_reports_idle() {
    let sched = scheduler(GatedWorker::new(&[]));
    let (status, body) = send(app(&sched), "GET", "/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["phase"], "idle");
    assert!(body["meta"]["timestamp"].is_string());
}

#[tokio::test]
async fn test_start_then_conflict() {
    let worker = GatedWorker::new(&["opening browser"]);
    let sched = scheduler(worker.clone());

    let (status, body) = send(
        app(&sched),
        "POST",
        "/api/v1/runs",
        Some(json!({ "itemCount": 3, "headless": true })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["trigger"], "manual");
    assert!(body["data"]["run_id"].is_string());

    let (status, body) = send(
        app(&sched),
        "POST",
        "/api/v1/runs",
        Some(json!({ "itemCount": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "already_running");

    sched.stop().unwrap();
}

#[tokio::test]
async fn test_invalid_parameters_are_rejected() {
    let worker = GatedWorker::new(&[]);
    let sched = scheduler(worker.clone());

    for payload in [
        json!({ "itemCount": 0 }),
        json!({ "itemCount": 21 }),
        json!({ "itemCount": 3, "recurring": true, "intervalMinutes": 10 }),
        json!({ "itemCount": "three" }),
    ] {
        let (status, body) = send(app(&sched), "POST", "/api/v1/runs", Some(payload)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_parameters");
    }

    assert_eq!(worker.invocations(), 0);
    let (_, body) = send(app(&sched), "GET", "/api/v1/runs/status", None).await;
    assert_eq!(body["data"]["phase"], "idle");
}

#[tokio::test]
async fn test_stop_without_run_conflicts() {
    let sched = scheduler(GatedWorker::new(&[]));
    let (status, body) = send(app(&sched), "POST", "/api/v1/runs/stop", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "no_active_run");
}

#[tokio::test]
async fn test_stop_active_run() {
    let sched = scheduler(GatedWorker::new(&[]));
    let mut events = sched.subscribe();
    sched.start(RunParameters::once(2, true)).unwrap();

    let (status, body) = send(app(&sched), "POST", "/api/v1/runs/stop", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["status"], "stopping");

    let done = next_completion(&mut events).await;
    assert!(!done.success);
    assert!(sched.list_history(None).unwrap().is_empty());
}

#[tokio::test]
async fn test_status_and_disarm_schedule() {
    let sched = scheduler(GatedWorker::new(&[]));
    let (status, _) = send(
        app(&sched),
        "POST",
        "/api/v1/runs",
        Some(json!({ "itemCount": 5, "recurring": true, "intervalMinutes": 45 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (_, body) = send(app(&sched), "GET", "/api/v1/runs/status", None).await;
    assert_eq!(body["data"]["phase"], "running");
    assert_eq!(body["data"]["schedule"]["interval_minutes"], 45);

    let (status, body) = send(app(&sched), "DELETE", "/api/v1/schedule", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["disarmed"], true);

    let (_, body) = send(app(&sched), "DELETE", "/api/v1/schedule", None).await;
    assert_eq!(body["data"]["disarmed"], false);

    let (_, body) = send(app(&sched), "GET", "/api/v1/runs/status", None).await;
    assert!(body["data"]["schedule"].is_null());

    sched.stop().unwrap();
}

#[tokio::test]
async fn test_history_lists_successful_runs() {
    let worker = GatedWorker::new(&["collecting"]);
    let sched = scheduler(worker.clone());
    let mut events = sched.subscribe();

    let (_, body) = send(app(&sched), "GET", "/api/v1/history", None).await;
    assert_eq!(body["data"], json!([]));

    let handle = sched.start(RunParameters::once(4, false)).unwrap();
    worker.release.notify_one();
    assert!(next_completion(&mut events).await.success);

    let (status, body) = send(app(&sched), "GET", "/api/v1/history?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    let records = body["data"].as_array().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0]["run_id"], handle.run_id.to_string());
    assert_eq!(records[0]["item_count"], 4);
    assert_eq!(records[0]["filename"], "iqiyi_20240501_093000.csv");

    // Reads do not change the listing.
    let (_, again) = send(app(&sched), "GET", "/api/v1/history?limit=10", None).await;
    assert_eq!(again["data"], body["data"]);
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let sched = scheduler(GatedWorker::new(&[]));
    let (status, body) = send(app(&sched), "GET", "/api/v1/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_event_stream_delivers_progress() {
    let worker = GatedWorker::new(&["opening browser"]);
    let sched = scheduler(worker.clone());

    let resp = app(&sched)
        .oneshot(
            Request::builder()
                .uri("/api/v1/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    sched.start(RunParameters::once(1, true)).unwrap();

    let mut body = resp.into_body().into_data_stream();
    let frame = body.next().await.unwrap().unwrap();
    let text = String::from_utf8(frame.to_vec()).unwrap();
    assert!(text.contains("event: progress"));
    assert!(text.contains("opening browser"));

    sched.stop().unwrap();
}

#[tokio::test]
async fn test_event_stream_ends_on_shutdown() {
    let sched = scheduler(GatedWorker::new(&[]));
    let state = AppState::new(sched.clone(), 5);
    let shutdown = state.shutdown.clone();

    let resp = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/v1/events")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    shutdown.cancel();
    let mut body = resp.into_body().into_data_stream();
    let end = tokio::time::timeout(std::time::Duration::from_secs(5), body.next())
        .await
        .expect("event stream still open after shutdown");
    assert!(end.is_none());
}
