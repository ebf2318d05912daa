//! PostgreSQL-backed store for the multi-host server.
//!
//! The claim primitive rides on `FOR UPDATE SKIP LOCKED`: concurrent
//! claimants each lock a different candidate row, so the oldest queued job
//! goes to exactly one of them without lock waits. Leases are kept against
//! the database clock (`lease_expires_at`) and the server reaps them
//! periodically.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};

use crate::config::DataRoot;
use crate::error::{Result, WhirrError};
use crate::store::types::*;
use crate::store::Store;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id BIGSERIAL PRIMARY KEY,
    name TEXT,
    command_argv TEXT NOT NULL,
    workdir TEXT NOT NULL,
    config TEXT,
    tags TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    attempt BIGINT NOT NULL DEFAULT 1,
    parent_job_id BIGINT REFERENCES jobs(id),
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    worker_id TEXT,
    heartbeat_at TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ,
    cancel_requested_at TIMESTAMPTZ,
    exit_code INTEGER,
    error_message TEXT,
    run_id TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_id BIGINT REFERENCES jobs(id),
    name TEXT,
    config TEXT,
    tags TEXT,
    status TEXT NOT NULL DEFAULT 'running',
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    finished_at TIMESTAMPTZ,
    duration_seconds DOUBLE PRECISION,
    summary TEXT,
    hostname TEXT,
    run_dir TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    pid INTEGER,
    gpu_index BIGINT,
    status TEXT NOT NULL DEFAULT 'idle',
    current_job_id BIGINT,
    started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    last_seen_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_lease ON jobs(lease_expires_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_job_id ON runs(job_id);
";

pub struct PgStore {
    pool: PgPool,
    data_root: DataRoot,
    hostname: String,
}

impl PgStore {
    /// Connect and migrate.
    pub async fn connect(database_url: &str, data_root: &DataRoot) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self {
            pool,
            data_root: data_root.clone(),
            hostname: crate::worker::local_hostname(),
        })
    }

    fn run_dir_str(&self, run_id: &str) -> String {
        self.data_root.run_dir(run_id).display().to_string()
    }
}

#[async_trait]
impl Store for PgStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueReceipt> {
        validate_spec(&spec)?;
        self.insert_job(&spec, 1).await
    }

    async fn claim_next(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<ClaimedJob>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE jobs
             SET status = 'running',
                 worker_id = $1,
                 started_at = NOW(),
                 heartbeat_at = NOW(),
                 lease_expires_at = NOW() + make_interval(secs => $2)
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE status = 'queued'
                 ORDER BY created_at, id
                 FOR UPDATE SKIP LOCKED
                 LIMIT 1
             )
             RETURNING id, name, command_argv, workdir, config, tags, attempt, run_id,
                       started_at, lease_expires_at",
        )
        .bind(worker_id)
        .bind(lease_seconds as f64)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id")?;
        let name: Option<String> = row.try_get("name")?;
        let config: Option<String> = row.try_get("config")?;
        let tags: Option<String> = row.try_get("tags")?;
        let run_id: String = row.try_get("run_id")?;
        let started_at: DateTime<Utc> = row.try_get("started_at")?;

        sqlx::query(
            "INSERT INTO runs (id, job_id, name, config, tags, status, started_at, hostname, run_dir)
             VALUES ($1, $2, $3, $4, $5, 'running', $6, $7, $8)
             ON CONFLICT (id) DO UPDATE SET
                 status = 'running',
                 started_at = EXCLUDED.started_at,
                 finished_at = NULL,
                 duration_seconds = NULL,
                 hostname = EXCLUDED.hostname",
        )
        .bind(&run_id)
        .bind(id)
        .bind(&name)
        .bind(&config)
        .bind(&tags)
        .bind(started_at)
        .bind(&self.hostname)
        .bind(self.run_dir_str(&run_id))
        .execute(&mut *tx)
        .await?;

        let claimed = ClaimedJob {
            id,
            name,
            command_argv: serde_json::from_str(row.try_get::<String, _>("command_argv")?.as_str())?,
            workdir: row.try_get("workdir")?,
            config: decode_json(config)?,
            tags: decode_tags(tags)?,
            attempt: row.try_get("attempt")?,
            run_id,
            lease_expires_at: row.try_get("lease_expires_at")?,
        };
        tx.commit().await?;
        Ok(Some(claimed))
    }

    async fn renew(&self, job_id: i64, worker_id: &str, lease_seconds: i64) -> Result<RenewAck> {
        let row = sqlx::query(
            "UPDATE jobs
             SET heartbeat_at = NOW(), lease_expires_at = NOW() + make_interval(secs => $1)
             WHERE id = $2 AND worker_id = $3 AND status = 'running'
             RETURNING lease_expires_at, cancel_requested_at",
        )
        .bind(lease_seconds as f64)
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Err(WhirrError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        };
        Ok(RenewAck {
            lease_expires_at: row.try_get("lease_expires_at")?,
            cancel_requested: row
                .try_get::<Option<DateTime<Utc>>, _>("cancel_requested_at")?
                .is_some(),
        })
    }

    async fn complete(
        &self,
        job_id: i64,
        worker_id: &str,
        exit_code: i32,
        status: TerminalStatus,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let changed = sqlx::query(
            "UPDATE jobs
             SET status = $1, finished_at = NOW(), exit_code = $2, error_message = $3,
                 worker_id = NULL, lease_expires_at = NULL
             WHERE id = $4 AND worker_id = $5 AND status = 'running'",
        )
        .bind(JobStatus::from(status).as_str())
        .bind(exit_code)
        .bind(error_message)
        .bind(job_id)
        .bind(worker_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if changed == 0 {
            return Err(WhirrError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }

        sqlx::query(
            "UPDATE runs
             SET status = $1, finished_at = NOW(),
                 duration_seconds = EXTRACT(EPOCH FROM (NOW() - started_at))::float8
             WHERE job_id = $2",
        )
        .bind(JobStatus::from(status).as_str())
        .bind(job_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn request_cancel(&self, job_id: i64) -> Result<JobStatus> {
        let row = sqlx::query("SELECT status FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Err(WhirrError::NotFound(format!("job {job_id}")));
        };
        let status = JobStatus::parse(row.try_get::<String, _>("status")?.as_str())
            .ok_or_else(|| WhirrError::StoreUnavailable("malformed job status".into()))?;

        match status {
            JobStatus::Queued => {
                sqlx::query(
                    "UPDATE jobs SET status = 'cancelled', finished_at = NOW(), exit_code = -1
                     WHERE id = $1 AND status = 'queued'",
                )
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
            JobStatus::Running => {
                sqlx::query(
                    "UPDATE jobs
                     SET cancel_requested_at = COALESCE(cancel_requested_at, NOW())
                     WHERE id = $1",
                )
                .bind(job_id)
                .execute(&self.pool)
                .await?;
            }
            _ => {}
        }
        Ok(status)
    }

    async fn cancel_all_queued(&self) -> Result<i64> {
        let changed = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', finished_at = NOW(), exit_code = -1
             WHERE status = 'queued'",
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(changed as i64)
    }

    async fn retry(&self, job_id: i64) -> Result<i64> {
        let original = self.get_job(job_id).await?;
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(WhirrError::NotRetryable {
                job_id,
                status: original.status.to_string(),
            });
        }
        let spec = JobSpec {
            command_argv: original.command_argv,
            workdir: original.workdir,
            name: original.name,
            tags: original.tags,
            config: original.config,
            parent_job_id: Some(job_id),
        };
        let receipt = self.insert_job(&spec, original.attempt + 1).await?;
        Ok(receipt.job_id)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "UPDATE jobs
             SET status = 'queued', worker_id = NULL, started_at = NULL,
                 heartbeat_at = NULL, lease_expires_at = NULL,
                 cancel_requested_at = NULL, attempt = attempt + 1
             WHERE status = 'running'
               AND lease_expires_at IS NOT NULL
               AND lease_expires_at < $1
             RETURNING id",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(WhirrError::from))
            .collect()
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => job_from_row(&row),
            None => Err(WhirrError::NotFound(format!("job {job_id}"))),
        }
    }

    async fn list_active(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs WHERE status IN ('queued', 'running') ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRow> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => run_from_row(&row),
            None => Err(WhirrError::NotFound(format!("run {run_id}"))),
        }
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>> {
        let mut qb = QueryBuilder::<sqlx::Postgres>::new("SELECT * FROM runs WHERE 1=1");
        if let Some(status) = &filter.status {
            qb.push(" AND status = ").push_bind(status.clone());
        }
        if let Some(tag) = &filter.tag {
            qb.push(" AND tags LIKE ").push_bind(format!("%\"{tag}\"%"));
        }
        qb.push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(filter.limit.unwrap_or(50));

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        pid: Option<i32>,
        gpu_index: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO workers (id, hostname, pid, gpu_index, status, started_at, last_seen_at)
             VALUES ($1, $2, $3, $4, 'idle', NOW(), NOW())
             ON CONFLICT (id) DO UPDATE SET
                 hostname = EXCLUDED.hostname,
                 pid = EXCLUDED.pid,
                 gpu_index = EXCLUDED.gpu_index,
                 status = 'idle',
                 current_job_id = NULL,
                 started_at = NOW(),
                 last_seen_at = NOW()",
        )
        .bind(worker_id)
        .bind(hostname)
        .bind(pid)
        .bind(gpu_index)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_worker_state(
        &self,
        worker_id: &str,
        state: WorkerState,
        current_job_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workers SET status = $1, current_job_id = $2, last_seen_at = NOW()
             WHERE id = $3",
        )
        .bind(state.as_str())
        .bind(current_job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        let rows = sqlx::query("SELECT * FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn status(&self) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "queued" => counts.queued = n,
                "running" => counts.running = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                "cancelled" => counts.cancelled = n,
                _ => {}
            }
        }

        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM workers GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "idle" => counts.workers_idle = n,
                "busy" => counts.workers_busy = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

impl PgStore {
    async fn insert_job(&self, spec: &JobSpec, attempt: i64) -> Result<EnqueueReceipt> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO jobs (name, command_argv, workdir, config, tags, parent_job_id, attempt)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING id",
        )
        .bind(&spec.name)
        .bind(serde_json::to_string(&spec.command_argv)?)
        .bind(&spec.workdir)
        .bind(spec.config.as_ref().map(serde_json::Value::to_string))
        .bind(encode_tags(&spec.tags)?)
        .bind(spec.parent_job_id)
        .bind(attempt)
        .fetch_one(&mut *tx)
        .await?;

        let job_id: i64 = row.try_get("id")?;
        let run_id = run_id_for_job(job_id);
        sqlx::query("UPDATE jobs SET run_id = $1 WHERE id = $2")
            .bind(&run_id)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(EnqueueReceipt {
            job_id,
            run_dir: self.run_dir_str(&run_id),
            run_id,
        })
    }
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    if spec.command_argv.is_empty() {
        return Err(WhirrError::InvalidSpec("command_argv must not be empty".into()));
    }
    if !std::path::Path::new(&spec.workdir).is_absolute() {
        return Err(WhirrError::InvalidSpec(format!(
            "workdir must be an absolute path, got {:?}",
            spec.workdir
        )));
    }
    Ok(())
}

fn encode_tags(tags: &[String]) -> Result<Option<String>> {
    if tags.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(tags)?))
    }
}

fn decode_tags(raw: Option<String>) -> Result<Vec<String>> {
    match raw {
        Some(s) => Ok(serde_json::from_str(&s)?),
        None => Ok(Vec::new()),
    }
}

fn decode_json(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        command_argv: serde_json::from_str(row.try_get::<String, _>("command_argv")?.as_str())?,
        workdir: row.try_get("workdir")?,
        config: decode_json(row.try_get("config")?)?,
        tags: decode_tags(row.try_get("tags")?)?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| WhirrError::StoreUnavailable(format!("malformed status {status}")))?,
        attempt: row.try_get("attempt")?,
        parent_job_id: row.try_get("parent_job_id")?,
        worker_id: row.try_get("worker_id")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        heartbeat_at: row.try_get("heartbeat_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        cancel_requested_at: row.try_get("cancel_requested_at")?,
        exit_code: row.try_get("exit_code")?,
        error_message: row.try_get("error_message")?,
        run_id: row.try_get("run_id")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunRow> {
    Ok(RunRow {
        run_id: row.try_get("id")?,
        job_id: row.try_get("job_id")?,
        name: row.try_get("name")?,
        status: row.try_get("status")?,
        tags: decode_tags(row.try_get("tags")?)?,
        config: decode_json(row.try_get("config")?)?,
        summary: decode_json(row.try_get("summary")?)?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        duration_seconds: row.try_get("duration_seconds")?,
        hostname: row.try_get("hostname")?,
        run_dir: row.try_get("run_dir")?,
    })
}

fn worker_from_row(row: &PgRow) -> Result<WorkerRow> {
    let status: String = row.try_get("status")?;
    Ok(WorkerRow {
        id: row.try_get("id")?,
        hostname: row.try_get("hostname")?,
        pid: row.try_get("pid")?,
        gpu_index: row.try_get("gpu_index")?,
        status: WorkerState::parse(&status)
            .ok_or_else(|| WhirrError::StoreUnavailable(format!("malformed status {status}")))?,
        current_job_id: row.try_get("current_job_id")?,
        started_at: row.try_get("started_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}
