//! Client-side realization of the store over the server's HTTP surface.
//!
//! Used by workers and submitters in networked mode. Transport failures fold
//! into `StoreUnavailable`; 404 and 409 responses map back to the same error
//! kinds the embedded store raises, so the worker loop behaves identically
//! in both modes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;

use crate::error::{Result, WhirrError};
use crate::store::types::*;
use crate::store::Store;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpStore {
    base_url: String,
    client: Client,
}

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    error: String,
    #[serde(default)]
    detail: String,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    job_id: i64,
    run_id: String,
    run_dir: String,
}

#[derive(Debug, Deserialize)]
struct RetryReply {
    job_id: i64,
}

#[derive(Debug, Deserialize)]
struct CancelReply {
    status: String,
}

#[derive(Debug, Deserialize)]
struct CancelAllReply {
    cancelled: i64,
}

impl HttpStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Pull the error body off a failed response; the kind falls back to the
    /// HTTP status when the body is not ours.
    async fn failure(&self, resp: Response) -> (StatusCode, String, String) {
        let status = resp.status();
        let body: WireErrorBody = resp.json().await.unwrap_or_else(|_| WireErrorBody {
            error: String::new(),
            detail: status.to_string(),
        });
        (status, body.error, body.detail)
    }

    async fn generic_error(&self, resp: Response) -> WhirrError {
        let (status, _, detail) = self.failure(resp).await;
        match status {
            StatusCode::NOT_FOUND => WhirrError::NotFound(detail),
            StatusCode::BAD_REQUEST => WhirrError::InvalidSpec(detail),
            _ => WhirrError::StoreUnavailable(detail),
        }
    }
}

#[async_trait]
impl Store for HttpStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueReceipt> {
        let resp = self
            .client
            .post(self.url("/api/v1/jobs"))
            .json(&serde_json::json!({
                "command_argv": spec.command_argv,
                "workdir": spec.workdir,
                "name": spec.name,
                "tags": spec.tags,
                "config": spec.config,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        let reply: SubmitReply = resp.json().await?;
        Ok(EnqueueReceipt {
            job_id: reply.job_id,
            run_id: reply.run_id,
            run_dir: reply.run_dir,
        })
    }

    async fn claim_next(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<ClaimedJob>> {
        let resp = self
            .client
            .post(self.url("/api/v1/jobs/claim"))
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "lease_seconds": lease_seconds,
            }))
            .send()
            .await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(Some(resp.json().await?))
    }

    async fn renew(&self, job_id: i64, worker_id: &str, lease_seconds: i64) -> Result<RenewAck> {
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/jobs/{job_id}/heartbeat")))
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "lease_seconds": lease_seconds,
            }))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(resp.json().await?),
            StatusCode::CONFLICT => Err(WhirrError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            }),
            _ => Err(self.generic_error(resp).await),
        }
    }

    async fn complete(
        &self,
        job_id: i64,
        worker_id: &str,
        exit_code: i32,
        status: TerminalStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/jobs/{job_id}/complete")))
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "exit_code": exit_code,
                "status": status,
                "error_message": error_message,
            }))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(WhirrError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            }),
            _ => Err(self.generic_error(resp).await),
        }
    }

    async fn request_cancel(&self, job_id: i64) -> Result<JobStatus> {
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/jobs/{job_id}/cancel")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        let reply: CancelReply = resp.json().await?;
        JobStatus::parse(&reply.status)
            .ok_or_else(|| WhirrError::StoreUnavailable(format!("bad status {}", reply.status)))
    }

    async fn cancel_all_queued(&self) -> Result<i64> {
        let resp = self
            .client
            .post(self.url("/api/v1/jobs/cancel_all"))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        let reply: CancelAllReply = resp.json().await?;
        Ok(reply.cancelled)
    }

    async fn retry(&self, job_id: i64) -> Result<i64> {
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/jobs/{job_id}/retry")))
            .send()
            .await?;
        match resp.status() {
            s if s.is_success() => {
                let reply: RetryReply = resp.json().await?;
                Ok(reply.job_id)
            }
            StatusCode::CONFLICT => {
                let (_, _, detail) = self.failure(resp).await;
                Err(WhirrError::NotRetryable {
                    job_id,
                    status: detail,
                })
            }
            _ => Err(self.generic_error(resp).await),
        }
    }

    /// Orphan recovery is the server's job in networked mode; a worker
    /// startup reap is a no-op here.
    async fn reap_expired(&self, _now: DateTime<Utc>) -> Result<Vec<i64>> {
        Ok(Vec::new())
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        let resp = self
            .client
            .get(self.url(&format!("/api/v1/jobs/{job_id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn list_active(&self) -> Result<Vec<Job>> {
        let resp = self.client.get(self.url("/api/v1/jobs")).send().await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRow> {
        let resp = self
            .client
            .get(self.url(&format!("/api/v1/runs/{run_id}")))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>> {
        let mut req = self.client.get(self.url("/api/v1/runs"));
        if let Some(status) = &filter.status {
            req = req.query(&[("status", status)]);
        }
        if let Some(tag) = &filter.tag {
            req = req.query(&[("tag", tag)]);
        }
        if let Some(limit) = filter.limit {
            req = req.query(&[("limit", limit.to_string())]);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        _pid: Option<i32>,
        gpu_index: Option<i64>,
    ) -> Result<()> {
        let resp = self
            .client
            .post(self.url("/api/v1/workers/register"))
            .json(&serde_json::json!({
                "worker_id": worker_id,
                "host": hostname,
                "slot": gpu_index,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(())
    }

    async fn set_worker_state(
        &self,
        worker_id: &str,
        state: WorkerState,
        current_job_id: Option<i64>,
    ) -> Result<()> {
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/workers/{worker_id}/heartbeat")))
            .json(&serde_json::json!({
                "status": state,
                "current_job_id": current_job_id,
            }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        let resp = self.client.get(self.url("/api/v1/workers")).send().await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(resp.json().await?)
    }

    async fn status(&self) -> Result<StatusCounts> {
        let resp = self.client.get(self.url("/api/v1/status")).send().await?;
        if !resp.status().is_success() {
            return Err(self.generic_error(resp).await);
        }
        Ok(resp.json().await?)
    }
}
