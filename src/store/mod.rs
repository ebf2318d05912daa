//! The scheduling store: jobs, workers, and the run index.
//!
//! One operation set, three realizations:
//! - [`SqliteStore`]: embedded single-file store for single-host setups.
//! - [`PgStore`]: PostgreSQL backing for the multi-host server.
//! - [`HttpStore`]: client-side realization speaking the server's HTTP
//!   surface, used by workers in networked mode.
//!
//! The claim primitive is serializable against concurrent claimants in every
//! realization; `NotOwner` is surfaced uniformly.

pub mod http;
pub mod postgres;
pub mod sqlite;
pub mod types;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
pub use http::HttpStore;
pub use postgres::PgStore;
pub use sqlite::SqliteStore;
pub use types::*;

/// Operations shared by all store realizations.
///
/// Ownership contract: while a job is `running`, only the worker whose id
/// matches `worker_id` may mutate it, and only through `renew` / `complete`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new queued job. Fails on a non-absolute workdir or empty argv.
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueReceipt>;

    /// Atomically claim the oldest queued job by `(created_at, id)`. Creates
    /// the run-index row in the same transaction. `None` when the queue is
    /// empty.
    async fn claim_next(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<ClaimedJob>>;

    /// Renew the lease iff `(job_id, worker_id)` still matches and the job is
    /// running. The ack carries back whether cancellation was requested.
    async fn renew(&self, job_id: i64, worker_id: &str, lease_seconds: i64) -> Result<RenewAck>;

    /// Terminal transition. Clears worker assignment and finalizes the run
    /// index row.
    async fn complete(
        &self,
        job_id: i64,
        worker_id: &str,
        exit_code: i32,
        status: TerminalStatus,
        error_message: Option<&str>,
    ) -> Result<()>;

    /// Request cancellation. Queued jobs cancel synchronously; running jobs
    /// get `cancel_requested_at` set for the owning worker to observe.
    /// Returns the job's status at the time of the call.
    async fn request_cancel(&self, job_id: i64) -> Result<JobStatus>;

    /// Cancel every queued job. Returns how many were cancelled.
    async fn cancel_all_queued(&self) -> Result<i64>;

    /// Resubmit a failed or cancelled job. The new job copies argv, workdir,
    /// name, tags and config, links `parent_job_id`, and increments `attempt`.
    /// Returns the new job id.
    async fn retry(&self, job_id: i64) -> Result<i64>;

    /// Return expired running jobs to the queue, incrementing their attempt.
    /// Idempotent; returns the requeued job ids.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<i64>>;

    async fn get_job(&self, job_id: i64) -> Result<Job>;

    /// All queued and running jobs, oldest first.
    async fn list_active(&self) -> Result<Vec<Job>>;

    async fn get_run(&self, run_id: &str) -> Result<RunRow>;

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>>;

    async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        pid: Option<i32>,
        gpu_index: Option<i64>,
    ) -> Result<()>;

    async fn set_worker_state(
        &self,
        worker_id: &str,
        state: WorkerState,
        current_job_id: Option<i64>,
    ) -> Result<()>;

    async fn list_workers(&self) -> Result<Vec<WorkerRow>>;

    async fn status(&self) -> Result<StatusCounts>;
}
