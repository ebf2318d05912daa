//! Embedded single-file store.
//!
//! WAL journal mode plus a `BEGIN IMMEDIATE` transaction make the claim
//! primitive exclusive: there is at most one writer at a time, so the
//! select-oldest-then-update step cannot race another claimant. The reap
//! signal in embedded mode is heartbeat age, not lease expiry, because all
//! workers share the host clock and the database file.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::config::{DataRoot, DEFAULT_HEARTBEAT_TIMEOUT_SECS};
use crate::error::{Result, WhirrError};
use crate::store::types::*;
use crate::store::Store;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT,
    command_argv TEXT NOT NULL,         -- JSON array of argv tokens
    workdir TEXT NOT NULL,
    config TEXT,                        -- JSON object
    tags TEXT,                          -- JSON array
    status TEXT NOT NULL DEFAULT 'queued',
    attempt INTEGER NOT NULL DEFAULT 1,
    parent_job_id INTEGER REFERENCES jobs(id),
    created_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT,
    worker_id TEXT,
    heartbeat_at TEXT,
    lease_expires_at TEXT,
    cancel_requested_at TEXT,
    exit_code INTEGER,
    error_message TEXT,
    run_id TEXT
);

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    job_id INTEGER REFERENCES jobs(id),
    name TEXT,
    config TEXT,                        -- JSON object
    tags TEXT,                          -- JSON array
    status TEXT NOT NULL DEFAULT 'running',
    started_at TEXT NOT NULL,
    finished_at TEXT,
    duration_seconds REAL,
    summary TEXT,                       -- JSON object
    hostname TEXT,
    run_dir TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS workers (
    id TEXT PRIMARY KEY,
    hostname TEXT NOT NULL,
    pid INTEGER,
    gpu_index INTEGER,
    status TEXT NOT NULL DEFAULT 'idle',
    current_job_id INTEGER,
    started_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_heartbeat ON jobs(heartbeat_at);
CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
CREATE INDEX IF NOT EXISTS idx_runs_job_id ON runs(job_id);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
    data_root: DataRoot,
    heartbeat_timeout_secs: i64,
    hostname: String,
}

impl SqliteStore {
    /// Open (and migrate) the store under an initialized data root.
    pub fn open(data_root: &DataRoot) -> Result<Self> {
        let conn = Connection::open(data_root.db_path())?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            data_root: data_root.clone(),
            heartbeat_timeout_secs: DEFAULT_HEARTBEAT_TIMEOUT_SECS,
            hostname: crate::worker::local_hostname(),
        })
    }

    pub fn with_heartbeat_timeout(mut self, secs: i64) -> Self {
        self.heartbeat_timeout_secs = secs;
        self
    }

    pub fn data_root(&self) -> &DataRoot {
        &self.data_root
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run_dir_str(&self, run_id: &str) -> String {
        self.data_root.run_dir(run_id).display().to_string()
    }

    fn insert_job(&self, conn: &Connection, spec: &JobSpec, attempt: i64) -> Result<EnqueueReceipt> {
        conn.execute(
            "INSERT INTO jobs (name, command_argv, workdir, config, tags, parent_job_id, attempt, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                spec.name,
                serde_json::to_string(&spec.command_argv)?,
                spec.workdir,
                spec.config.as_ref().map(serde_json::Value::to_string),
                encode_tags(&spec.tags)?,
                spec.parent_job_id,
                attempt,
                fmt_ts(Utc::now()),
            ],
        )?;
        let job_id = conn.last_insert_rowid();
        let run_id = run_id_for_job(job_id);
        conn.execute(
            "UPDATE jobs SET run_id = ?1 WHERE id = ?2",
            params![run_id, job_id],
        )?;
        Ok(EnqueueReceipt {
            job_id,
            run_dir: self.run_dir_str(&run_id),
            run_id,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn enqueue(&self, spec: JobSpec) -> Result<EnqueueReceipt> {
        validate_spec(&spec)?;
        let conn = self.conn();
        self.insert_job(&conn, &spec, 1)
    }

    async fn claim_next(&self, worker_id: &str, lease_seconds: i64) -> Result<Option<ClaimedJob>> {
        let mut guard = self.conn();
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let now = Utc::now();
        let lease_expires_at = now + ChronoDuration::seconds(lease_seconds);
        let row = tx
            .query_row(
                "UPDATE jobs
                 SET status = 'running',
                     worker_id = ?1,
                     started_at = ?2,
                     heartbeat_at = ?2,
                     lease_expires_at = ?3
                 WHERE id = (
                     SELECT id FROM jobs
                     WHERE status = 'queued'
                     ORDER BY created_at, id
                     LIMIT 1
                 )
                 RETURNING id, name, command_argv, workdir, config, tags, attempt, run_id",
                params![worker_id, fmt_ts(now), fmt_ts(lease_expires_at)],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, argv, workdir, config, tags, attempt, run_id)) = row else {
            tx.commit()?;
            return Ok(None);
        };

        // The run-index row is born in the same transaction as the claim.
        // A requeued job reuses its run id, so this upserts.
        tx.execute(
            "INSERT INTO runs (id, job_id, name, config, tags, status, started_at, hostname, run_dir)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 status = 'running',
                 started_at = excluded.started_at,
                 finished_at = NULL,
                 duration_seconds = NULL,
                 hostname = excluded.hostname",
            params![
                run_id,
                id,
                name,
                config,
                tags,
                fmt_ts(now),
                self.hostname,
                self.run_dir_str(&run_id),
            ],
        )?;
        tx.commit()?;

        Ok(Some(ClaimedJob {
            id,
            name,
            command_argv: serde_json::from_str(&argv)?,
            workdir,
            config: decode_json(config)?,
            tags: decode_tags(tags)?,
            attempt,
            run_id,
            lease_expires_at,
        }))
    }

    async fn renew(&self, job_id: i64, worker_id: &str, lease_seconds: i64) -> Result<RenewAck> {
        let conn = self.conn();
        let now = Utc::now();
        let lease_expires_at = now + ChronoDuration::seconds(lease_seconds);
        let changed = conn.execute(
            "UPDATE jobs SET heartbeat_at = ?1, lease_expires_at = ?2
             WHERE id = ?3 AND worker_id = ?4 AND status = 'running'",
            params![fmt_ts(now), fmt_ts(lease_expires_at), job_id, worker_id],
        )?;
        if changed == 0 {
            return Err(WhirrError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        let cancel: Option<String> = conn.query_row(
            "SELECT cancel_requested_at FROM jobs WHERE id = ?1",
            params![job_id],
            |row| row.get(0),
        )?;
        Ok(RenewAck {
            lease_expires_at,
            cancel_requested: cancel.is_some(),
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
        let mut guard = self.conn();
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = Utc::now();
        let changed = tx.execute(
            "UPDATE jobs
             SET status = ?1, finished_at = ?2, exit_code = ?3, error_message = ?4,
                 worker_id = NULL, lease_expires_at = NULL
             WHERE id = ?5 AND worker_id = ?6 AND status = 'running'",
            params![
                JobStatus::from(status).as_str(),
                fmt_ts(now),
                exit_code,
                error_message,
                job_id,
                worker_id
            ],
        )?;
        if changed == 0 {
            return Err(WhirrError::NotOwner {
                job_id,
                worker_id: worker_id.to_string(),
            });
        }
        finalize_run_row(&tx, job_id, status, now)?;
        tx.commit()?;
        Ok(())
    }

    async fn request_cancel(&self, job_id: i64) -> Result<JobStatus> {
        let conn = self.conn();
        let status: Option<String> = conn
            .query_row(
                "SELECT status FROM jobs WHERE id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(status) = status.and_then(|s| JobStatus::parse(&s)) else {
            return Err(WhirrError::NotFound(format!("job {job_id}")));
        };

        let now = fmt_ts(Utc::now());
        match status {
            JobStatus::Queued => {
                // Never ran, so there is no child exit code; the sentinel
                // keeps terminal rows uniform.
                conn.execute(
                    "UPDATE jobs SET status = 'cancelled', finished_at = ?1, exit_code = -1
                     WHERE id = ?2 AND status = 'queued'",
                    params![now, job_id],
                )?;
            }
            JobStatus::Running => {
                conn.execute(
                    "UPDATE jobs SET cancel_requested_at = COALESCE(cancel_requested_at, ?1)
                     WHERE id = ?2",
                    params![now, job_id],
                )?;
            }
            _ => {}
        }
        Ok(status)
    }

    async fn cancel_all_queued(&self) -> Result<i64> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'cancelled', finished_at = ?1, exit_code = -1
             WHERE status = 'queued'",
            params![fmt_ts(Utc::now())],
        )?;
        Ok(changed as i64)
    }

    async fn retry(&self, job_id: i64) -> Result<i64> {
        let conn = self.conn();
        let original = get_job_row(&conn, job_id)?;
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
        let receipt = self.insert_job(&conn, &spec, original.attempt + 1)?;
        Ok(receipt.job_id)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let conn = self.conn();
        let cutoff = fmt_ts(now - ChronoDuration::seconds(self.heartbeat_timeout_secs));
        let mut stmt = conn.prepare(
            "SELECT id FROM jobs
             WHERE status = 'running' AND heartbeat_at IS NOT NULL AND heartbeat_at < ?1",
        )?;
        let ids: Vec<i64> = stmt
            .query_map(params![cutoff], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;
        for id in &ids {
            conn.execute(
                "UPDATE jobs
                 SET status = 'queued', worker_id = NULL, started_at = NULL,
                     heartbeat_at = NULL, lease_expires_at = NULL,
                     cancel_requested_at = NULL, attempt = attempt + 1
                 WHERE id = ?1 AND status = 'running'",
                params![id],
            )?;
        }
        Ok(ids)
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        let conn = self.conn();
        get_job_row(&conn, job_id)
    }

    async fn list_active(&self) -> Result<Vec<Job>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT * FROM jobs WHERE status IN ('queued', 'running') ORDER BY created_at, id",
        )?;
        let jobs = stmt
            .query_map([], job_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        jobs.into_iter().map(finish_job_decode).collect()
    }

    async fn get_run(&self, run_id: &str) -> Result<RunRow> {
        let conn = self.conn();
        let run = conn
            .query_row(
                "SELECT * FROM runs WHERE id = ?1",
                params![run_id],
                run_from_row,
            )
            .optional()?;
        match run {
            Some(raw) => finish_run_decode(raw),
            None => Err(WhirrError::NotFound(format!("run {run_id}"))),
        }
    }

    async fn list_runs(&self, filter: RunFilter) -> Result<Vec<RunRow>> {
        let conn = self.conn();
        let limit = filter.limit.unwrap_or(50);
        let mut sql = String::from("SELECT * FROM runs WHERE 1=1");
        let mut binds: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            binds.push(Box::new(status.clone()));
        }
        if let Some(tag) = &filter.tag {
            sql.push_str(" AND tags LIKE ?");
            binds.push(Box::new(format!("%\"{tag}\"%")));
        }
        sql.push_str(" ORDER BY started_at DESC LIMIT ?");
        binds.push(Box::new(limit));

        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(rusqlite::params_from_iter(binds.iter().map(|b| b.as_ref())), run_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        runs.into_iter().map(finish_run_decode).collect()
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        hostname: &str,
        pid: Option<i32>,
        gpu_index: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());
        conn.execute(
            "INSERT INTO workers (id, hostname, pid, gpu_index, status, started_at, last_seen_at)
             VALUES (?1, ?2, ?3, ?4, 'idle', ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 hostname = excluded.hostname,
                 pid = excluded.pid,
                 gpu_index = excluded.gpu_index,
                 status = 'idle',
                 current_job_id = NULL,
                 started_at = excluded.started_at,
                 last_seen_at = excluded.last_seen_at",
            params![worker_id, hostname, pid, gpu_index, now],
        )?;
        Ok(())
    }

    async fn set_worker_state(
        &self,
        worker_id: &str,
        state: WorkerState,
        current_job_id: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "UPDATE workers SET status = ?1, current_job_id = ?2, last_seen_at = ?3 WHERE id = ?4",
            params![state.as_str(), current_job_id, fmt_ts(Utc::now()), worker_id],
        )?;
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT * FROM workers ORDER BY id")?;
        let workers = stmt
            .query_map([], worker_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(workers)
    }

    async fn status(&self) -> Result<StatusCounts> {
        let conn = self.conn();
        let mut counts = StatusCounts::default();

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM jobs GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "queued" => counts.queued = n,
                "running" => counts.running = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                "cancelled" => counts.cancelled = n,
                _ => {}
            }
        }

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM workers GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.as_str() {
                "idle" => counts.workers_idle = n,
                "busy" => counts.workers_busy = n,
                _ => {}
            }
        }
        Ok(counts)
    }
}

fn validate_spec(spec: &JobSpec) -> Result<()> {
    if spec.command_argv.is_empty() {
        return Err(WhirrError::InvalidSpec("command_argv must not be empty".into()));
    }
    if !Path::new(&spec.workdir).is_absolute() {
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

fn ts_col(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(name)?;
    parse_ts(&s).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("malformed timestamp in column {name}: {s}").into(),
        )
    })
}

fn opt_ts_col(row: &rusqlite::Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(name)?;
    match s {
        None => Ok(None),
        Some(s) => match parse_ts(&s) {
            Some(ts) => Ok(Some(ts)),
            None => Err(rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                format!("malformed timestamp in column {name}: {s}").into(),
            )),
        },
    }
}

/// Intermediate row with JSON columns still encoded; rusqlite's row mapper
/// cannot return `WhirrError`, so decoding finishes outside it.
struct RawJob {
    job: Job,
    argv: String,
    config: Option<String>,
    tags: Option<String>,
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawJob> {
    let status: String = row.get("status")?;
    Ok(RawJob {
        job: Job {
            id: row.get("id")?,
            name: row.get("name")?,
            command_argv: Vec::new(),
            workdir: row.get("workdir")?,
            config: None,
            tags: Vec::new(),
            status: JobStatus::parse(&status).unwrap_or(JobStatus::Failed),
            attempt: row.get("attempt")?,
            parent_job_id: row.get("parent_job_id")?,
            worker_id: row.get("worker_id")?,
            created_at: ts_col(row, "created_at")?,
            started_at: opt_ts_col(row, "started_at")?,
            finished_at: opt_ts_col(row, "finished_at")?,
            heartbeat_at: opt_ts_col(row, "heartbeat_at")?,
            lease_expires_at: opt_ts_col(row, "lease_expires_at")?,
            cancel_requested_at: opt_ts_col(row, "cancel_requested_at")?,
            exit_code: row.get("exit_code")?,
            error_message: row.get("error_message")?,
            run_id: row.get("run_id")?,
        },
        argv: row.get("command_argv")?,
        config: row.get("config")?,
        tags: row.get("tags")?,
    })
}

fn finish_job_decode(raw: RawJob) -> Result<Job> {
    let mut job = raw.job;
    job.command_argv = serde_json::from_str(&raw.argv)?;
    job.config = decode_json(raw.config)?;
    job.tags = decode_tags(raw.tags)?;
    Ok(job)
}

fn get_job_row(conn: &Connection, job_id: i64) -> Result<Job> {
    let raw = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![job_id],
            job_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => finish_job_decode(raw),
        None => Err(WhirrError::NotFound(format!("job {job_id}"))),
    }
}

struct RawRun {
    run: RunRow,
    config: Option<String>,
    tags: Option<String>,
    summary: Option<String>,
}

fn run_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRun> {
    Ok(RawRun {
        run: RunRow {
            run_id: row.get("id")?,
            job_id: row.get("job_id")?,
            name: row.get("name")?,
            status: row.get("status")?,
            tags: Vec::new(),
            config: None,
            summary: None,
            started_at: ts_col(row, "started_at")?,
            finished_at: opt_ts_col(row, "finished_at")?,
            duration_seconds: row.get("duration_seconds")?,
            hostname: row.get("hostname")?,
            run_dir: row.get("run_dir")?,
        },
        config: row.get("config")?,
        tags: row.get("tags")?,
        summary: row.get("summary")?,
    })
}

fn finish_run_decode(raw: RawRun) -> Result<RunRow> {
    let mut run = raw.run;
    run.config = decode_json(raw.config)?;
    run.tags = decode_tags(raw.tags)?;
    run.summary = decode_json(raw.summary)?;
    Ok(run)
}

fn worker_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkerRow> {
    let status: String = row.get("status")?;
    Ok(WorkerRow {
        id: row.get("id")?,
        hostname: row.get("hostname")?,
        pid: row.get("pid")?,
        gpu_index: row.get("gpu_index")?,
        status: WorkerState::parse(&status).unwrap_or(WorkerState::Stopped),
        current_job_id: row.get("current_job_id")?,
        started_at: ts_col(row, "started_at")?,
        last_seen_at: ts_col(row, "last_seen_at")?,
    })
}

fn finalize_run_row(
    conn: &Connection,
    job_id: i64,
    status: TerminalStatus,
    now: DateTime<Utc>,
) -> Result<()> {
    let started: Option<String> = conn
        .query_row(
            "SELECT started_at FROM runs WHERE job_id = ?1",
            params![job_id],
            |row| row.get(0),
        )
        .optional()?;
    let duration = started
        .as_deref()
        .and_then(parse_ts)
        .map(|s| (now - s).num_milliseconds() as f64 / 1000.0);
    conn.execute(
        "UPDATE runs SET status = ?1, finished_at = ?2, duration_seconds = ?3 WHERE job_id = ?4",
        params![
            JobStatus::from(status).as_str(),
            fmt_ts(now),
            duration,
            job_id
        ],
    )?;
    Ok(())
}
