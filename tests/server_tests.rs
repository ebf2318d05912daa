use std::fs;
use std::io::Write;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

use whirr::config::DataRoot;
use whirr::server::{router, AppState};
use whirr::store::{SqliteStore, Store};

struct TestServer {
    app: Router,
    root: DataRoot,
    _dir: TempDir,
}

fn test_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let root = DataRoot::create(dir.path()).unwrap();
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&root).unwrap());
    let app = router(AppState {
        store,
        data_root: root.clone(),
    });
    TestServer {
        app,
        root,
        _dir: dir,
    }
}

async fn request(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(value) => builder
            .header("content-type", "application/json")
            .body(Body::from(value.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn submit_body(script: &str) -> Value {
    json!({
        "command_argv": ["/bin/sh", "-c", script],
        "workdir": "/tmp",
        "name": "it",
        "tags": ["t1"],
    })
}

async fn submit(app: &Router, script: &str) -> i64 {
    let (status, body) = request(app, "POST", "/api/v1/jobs", Some(submit_body(script))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["job_id"].as_i64().unwrap()
}

async fn claim(app: &Router, worker_id: &str) -> Value {
    let (status, body) = request(
        app,
        "POST",
        "/api/v1/jobs/claim",
        Some(json!({"worker_id": worker_id, "lease_seconds": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body
}

#[tokio::test]
async fn health_reports_healthy() {
    let server = test_server();
    let (status, body) = request(&server.app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn submit_returns_ids_and_job_is_queued() {
    let server = test_server();
    let (status, body) =
        request(&server.app, "POST", "/api/v1/jobs", Some(submit_body("true"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let job_id = body["job_id"].as_i64().unwrap();
    assert_eq!(body["run_id"], format!("job-{job_id}"));
    assert!(body["run_dir"].as_str().unwrap().contains("runs/job-"));

    let (status, job) =
        request(&server.app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "queued");
    assert_eq!(job["attempt"], 1);
    assert_eq!(job["tags"], json!(["t1"]));
}

#[tokio::test]
async fn submit_with_relative_workdir_is_a_bad_request() {
    let server = test_server();
    let (status, body) = request(
        &server.app,
        "POST",
        "/api/v1/jobs",
        Some(json!({"command_argv": ["true"], "workdir": "relative"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_spec");
    assert!(body["detail"].as_str().unwrap().contains("absolute"));
}

#[tokio::test]
async fn unknown_job_is_a_structured_404() {
    let server = test_server();
    let (status, body) = request(&server.app, "GET", "/api/v1/jobs/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn claim_hands_out_the_job_then_204s() {
    let server = test_server();
    let job_id = submit(&server.app, "sleep 60").await;

    let job = claim(&server.app, "w1").await;
    assert_eq!(job["id"].as_i64().unwrap(), job_id);
    assert_eq!(job["run_id"], format!("job-{job_id}"));
    assert!(job["lease_expires_at"].is_string());

    let (status, _) = request(
        &server.app,
        "POST",
        "/api/v1/jobs/claim",
        Some(json!({"worker_id": "w2", "lease_seconds": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn heartbeat_carries_back_cancellation() {
    let server = test_server();
    let job_id = submit(&server.app, "sleep 60").await;
    claim(&server.app, "w1").await;

    let (status, ack) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/heartbeat"),
        Some(json!({"worker_id": "w1", "lease_seconds": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["cancel_requested"], false);
    assert!(ack["lease_expires_at"].is_string());

    let (status, cancel) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/cancel"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cancel["status"], "running");

    let (_, ack) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/heartbeat"),
        Some(json!({"worker_id": "w1", "lease_seconds": 60})),
    )
    .await;
    assert_eq!(ack["cancel_requested"], true);
}

#[tokio::test]
async fn heartbeat_from_the_wrong_worker_conflicts() {
    let server = test_server();
    let job_id = submit(&server.app, "sleep 60").await;
    claim(&server.app, "w1").await;

    let (status, body) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/heartbeat"),
        Some(json!({"worker_id": "w2", "lease_seconds": 60})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_owner");
}

#[tokio::test]
async fn complete_finalizes_job_and_status_counts() {
    let server = test_server();
    let job_id = submit(&server.app, "true").await;
    claim(&server.app, "w1").await;

    let (status, _) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/complete"),
        Some(json!({"worker_id": "w1", "exit_code": 0, "status": "completed"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, job) = request(&server.app, "GET", &format!("/api/v1/jobs/{job_id}"), None).await;
    assert_eq!(job["status"], "completed");
    assert_eq!(job["exit_code"], 0);
    assert_eq!(job["worker_id"], Value::Null);

    let (status, counts) = request(&server.app, "GET", "/api/v1/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(counts["completed"], 1);
    assert_eq!(counts["queued"], 0);
}

#[tokio::test]
async fn retry_creates_a_linked_job() {
    let server = test_server();
    let job_id = submit(&server.app, "false").await;
    claim(&server.app, "w1").await;
    request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/complete"),
        Some(json!({"worker_id": "w1", "exit_code": 1, "status": "failed"})),
    )
    .await;

    let (status, body) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/retry"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let new_id = body["job_id"].as_i64().unwrap();

    let (_, job) = request(&server.app, "GET", &format!("/api/v1/jobs/{new_id}"), None).await;
    assert_eq!(job["parent_job_id"].as_i64().unwrap(), job_id);
    assert_eq!(job["attempt"], 2);
    assert_eq!(job["status"], "queued");
}

#[tokio::test]
async fn retry_of_a_queued_job_conflicts() {
    let server = test_server();
    let job_id = submit(&server.app, "true").await;

    let (status, body) = request(
        &server.app,
        "POST",
        &format!("/api/v1/jobs/{job_id}/retry"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "not_retryable");
}

#[tokio::test]
async fn workers_register_and_list() {
    let server = test_server();
    let (status, _) = request(
        &server.app,
        "POST",
        "/api/v1/workers/register",
        Some(json!({"worker_id": "gpu-node:0", "host": "gpu-node", "slot": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = request(
        &server.app,
        "POST",
        "/api/v1/workers/gpu-node:0/heartbeat",
        Some(json!({"status": "busy", "current_job_id": 1})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, workers) = request(&server.app, "GET", "/api/v1/workers", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(workers.as_array().unwrap().len(), 1);
    assert_eq!(workers[0]["id"], "gpu-node:0");
    assert_eq!(workers[0]["status"], "busy");
}

#[tokio::test]
async fn runs_listing_and_detail_with_meta() {
    let server = test_server();
    let job_id = submit(&server.app, "true").await;
    claim(&server.app, "w1").await;
    let run_id = format!("job-{job_id}");

    let (status, runs) = request(&server.app, "GET", "/api/v1/runs?status=running", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["run_id"], run_id);

    // Detail before the worker writes anything: index row only.
    let (status, detail) =
        request(&server.app, "GET", &format!("/api/v1/runs/{run_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["run_id"], run_id);
    assert_eq!(detail["meta"], Value::Null);

    // Once the run directory has a meta.json, the detail includes it.
    let run_dir = server.root.run_dir(&run_id);
    fs::create_dir_all(&run_dir).unwrap();
    fs::write(
        run_dir.join("meta.json"),
        json!({
            "run_id": run_id,
            "status": "running",
            "started_at": "2026-08-01T00:00:00Z",
            "tags": [],
            "config_file": "config.json",
        })
        .to_string(),
    )
    .unwrap();
    let (_, detail) = request(&server.app, "GET", &format!("/api/v1/runs/{run_id}"), None).await;
    assert_eq!(detail["meta"]["status"], "running");
}

#[tokio::test]
async fn run_metrics_tolerate_a_truncated_tail() {
    let server = test_server();
    let job_id = submit(&server.app, "true").await;
    claim(&server.app, "w1").await;
    let run_id = format!("job-{job_id}");

    let run_dir = server.root.run_dir(&run_id);
    fs::create_dir_all(&run_dir).unwrap();
    let mut f = fs::File::create(run_dir.join("metrics.jsonl")).unwrap();
    writeln!(f, "{}", json!({"_idx": 0, "loss": 0.9})).unwrap();
    writeln!(f, "{}", json!({"_idx": 1, "loss": 0.7})).unwrap();
    write!(f, "{{\"_idx\": 2, \"lo").unwrap();
    drop(f);

    let (status, metrics) = request(
        &server.app,
        "GET",
        &format!("/api/v1/runs/{run_id}/metrics"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics.as_array().unwrap().len(), 2);
    assert_eq!(metrics[1]["_idx"], 1);
}

#[tokio::test]
async fn artifacts_are_listed_and_served() {
    let server = test_server();
    let job_id = submit(&server.app, "true").await;
    claim(&server.app, "w1").await;
    let run_id = format!("job-{job_id}");

    let artifacts = server.root.run_dir(&run_id).join("artifacts");
    fs::create_dir_all(artifacts.join("checkpoints")).unwrap();
    fs::write(artifacts.join("checkpoints/best.pt"), b"weights").unwrap();

    let (status, listing) = request(
        &server.app,
        "GET",
        &format!("/api/v1/runs/{run_id}/artifacts"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listing[0]["path"], "checkpoints/best.pt");
    assert_eq!(listing[0]["size"], 7);

    let response = server
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/api/v1/runs/{run_id}/artifacts/checkpoints/best.pt"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&bytes[..], b"weights");

    let (status, _) = request(
        &server.app,
        "GET",
        &format!("/api/v1/runs/{run_id}/artifacts/checkpoints/../../meta.json"),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cancel_all_clears_the_queue() {
    let server = test_server();
    submit(&server.app, "true").await;
    submit(&server.app, "true").await;

    let (status, body) = request(&server.app, "POST", "/api/v1/jobs/cancel_all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], 2);

    let (_, jobs) = request(&server.app, "GET", "/api/v1/jobs", None).await;
    assert_eq!(jobs.as_array().unwrap().len(), 0);
}
