//! HTTP front for the store in networked mode.
//!
//! Workers and submitters on other hosts speak this surface; run data itself
//! lives on the shared filesystem, so artifact and metric reads go straight
//! to the run directories under the server's data root.

pub mod models;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};

use crate::config::DataRoot;
use crate::error::WhirrError;
use crate::run::{read_jsonl, RunDir};
use crate::store::Store;
use models::*;

/// How often the server-side reaper returns expired leases to the queue.
/// Must not exceed the lease period.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub data_root: DataRoot,
}

/// Errors cross the wire as `{"error": kind, "detail": message}`.
pub struct ApiError(WhirrError);

impl From<WhirrError> for ApiError {
    fn from(e: WhirrError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            WhirrError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            WhirrError::NotOwner { .. } => (StatusCode::CONFLICT, "not_owner"),
            WhirrError::NotRetryable { .. } => (StatusCode::CONFLICT, "not_retryable"),
            WhirrError::InvalidSpec(_) => (StatusCode::BAD_REQUEST, "invalid_spec"),
            WhirrError::StoreUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable"),
            WhirrError::NotInitialized(_) => (StatusCode::INTERNAL_SERVER_ERROR, "not_initialized"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorBody {
            error: kind.to_string(),
            detail: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/api/v1/status", get(status))
        .route("/api/v1/jobs", post(submit_job).get(list_jobs))
        .route("/api/v1/jobs/claim", post(claim_job))
        .route("/api/v1/jobs/cancel_all", post(cancel_all_queued))
        .route("/api/v1/jobs/:id", get(get_job))
        .route("/api/v1/jobs/:id/cancel", post(cancel_job))
        .route("/api/v1/jobs/:id/retry", post(retry_job))
        .route("/api/v1/jobs/:id/heartbeat", post(job_heartbeat))
        .route("/api/v1/jobs/:id/complete", post(complete_job))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/:id/heartbeat", post(worker_heartbeat))
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/runs", get(list_runs))
        .route("/api/v1/runs/:run_id", get(get_run))
        .route("/api/v1/runs/:run_id/metrics", get(get_run_metrics))
        .route("/api/v1/runs/:run_id/artifacts", get(list_run_artifacts))
        .route("/api/v1/runs/:run_id/artifacts/*path", get(get_run_artifact))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until the token is cancelled. Runs the periodic orphan
/// reaper alongside the listener.
pub async fn serve(
    addr: SocketAddr,
    state: AppState,
    shutdown: CancellationToken,
) -> crate::error::Result<()> {
    let reaper_store = state.store.clone();
    let reaper_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(REAP_INTERVAL);
        loop {
            tokio::select! {
                _ = tick.tick() => {}
                _ = reaper_shutdown.cancelled() => break,
            }
            match reaper_store.reap_expired(Utc::now()).await {
                Ok(requeued) if !requeued.is_empty() => {
                    tracing::warn!(jobs = ?requeued, "requeued jobs with expired leases");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "lease reaper failed"),
            }
        }
    });

    let app = router(state);
    tracing::info!(addr = %addr, "starting whirr server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "healthy"}))
}

async fn status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.status().await?))
}

async fn submit_job(
    State(state): State<AppState>,
    Json(req): Json<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let spec = crate::store::JobSpec {
        command_argv: req.command_argv,
        workdir: req.workdir,
        name: req.name,
        tags: req.tags,
        config: req.config,
        parent_job_id: None,
    };
    let receipt = state.store.enqueue(spec).await?;
    let message = format!("job {} queued", receipt.job_id);
    Ok((
        StatusCode::CREATED,
        Json(SubmitResponse {
            job_id: receipt.job_id,
            run_id: receipt.run_id,
            run_dir: receipt.run_dir,
            message,
        }),
    ))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.get_job(id).await?))
}

async fn claim_job(
    State(state): State<AppState>,
    Json(req): Json<ClaimRequest>,
) -> ApiResult<Response> {
    match state
        .store
        .claim_next(&req.worker_id, req.lease_seconds)
        .await?
    {
        Some(job) => Ok(Json(job).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_active().await?))
}

async fn cancel_all_queued(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let cancelled = state.store.cancel_all_queued().await?;
    Ok(Json(serde_json::json!({"cancelled": cancelled})))
}

async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let status = state.store.request_cancel(id).await?;
    Ok(Json(CancelResponse {
        status: status.to_string(),
    }))
}

async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let job_id = state.store.retry(id).await?;
    Ok(Json(RetryResponse { job_id }))
}

async fn job_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    let ack = state
        .store
        .renew(id, &req.worker_id, req.lease_seconds)
        .await?;
    Ok(Json(ack))
}

async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .store
        .complete(
            id,
            &req.worker_id,
            req.exit_code,
            req.status,
            req.error_message.as_deref(),
        )
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .store
        .register_worker(&req.worker_id, &req.host, None, req.slot)
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    state
        .store
        .set_worker_state(&id, req.status, req.current_job_id)
        .await?;
    Ok(Json(serde_json::json!({})))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.store.list_workers().await?))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<impl IntoResponse> {
    let runs = state
        .store
        .list_runs(crate::store::RunFilter {
            status: query.status,
            tag: query.tag,
            limit: query.limit,
        })
        .await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let run = state.store.get_run(&run_id).await?;
    let meta = RunDir::open(&state.data_root.runs_dir(), &run_id)
        .ok()
        .and_then(|dir| dir.read_meta().ok());
    Ok(Json(RunDetailResponse { run, meta }))
}

async fn get_run_metrics(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let dir = RunDir::open(&state.data_root.runs_dir(), &run_id)?;
    let records = read_jsonl(&dir.metrics_path())?;
    Ok(Json(records))
}

async fn list_run_artifacts(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let dir = RunDir::open(&state.data_root.runs_dir(), &run_id)?;
    Ok(Json(dir.list_artifacts()?))
}

async fn get_run_artifact(
    State(state): State<AppState>,
    Path((run_id, path)): Path<(String, String)>,
) -> ApiResult<Response> {
    let dir = RunDir::open(&state.data_root.runs_dir(), &run_id)?;
    let Some(full) = dir.resolve_artifact(&path) else {
        return Err(WhirrError::NotFound(format!("artifact {path}")).into());
    };
    let bytes = tokio::fs::read(full).await.map_err(WhirrError::from)?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}
