//! Request and response bodies for the HTTP surface.

use serde::{Deserialize, Serialize};

use crate::run::RunMeta;
use crate::store::{RunRow, TerminalStatus, WorkerState};

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub command_argv: Vec<String>,
    pub workdir: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: i64,
    pub run_id: String,
    pub run_dir: String,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub worker_id: String,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub worker_id: String,
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: i64,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    pub worker_id: String,
    pub exit_code: i32,
    pub status: TerminalStatus,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub worker_id: String,
    pub host: String,
    #[serde(default)]
    pub slot: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub status: WorkerState,
    #[serde(default)]
    pub current_job_id: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct RetryResponse {
    pub job_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
}

/// Run index row plus the parsed `meta.json`, when the directory has one.
#[derive(Debug, Serialize)]
pub struct RunDetailResponse {
    #[serde(flatten)]
    pub run: RunRow,
    pub meta: Option<RunMeta>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub detail: String,
}

fn default_lease_seconds() -> i64 {
    crate::config::DEFAULT_LEASE_SECONDS
}
