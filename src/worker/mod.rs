//! The worker: a long-lived process that claims jobs one at a time and
//! supervises them to completion.
//!
//! One worker per accelerator is the intended pattern; worker-to-worker
//! parallelism is by separate processes and the store is the only shared
//! mutable resource.

pub mod supervisor;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::config::{DataRoot, WorkerConfig};
use crate::error::{Result, WhirrError};
use crate::run::{capture_git_info, RunDir, RunMeta, RunStatus};
use crate::shutdown::Shutdown;
use crate::store::{ClaimedJob, Store, TerminalStatus, WorkerState};
use supervisor::{Backoff, Supervised, Supervisor};

pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Worker ids are `<host>:<slot>`, slot being the accelerator index or
/// `default`.
pub fn derive_worker_id(host: &str, gpu_index: Option<u32>) -> String {
    match gpu_index {
        Some(i) => format!("{host}:{i}"),
        None => format!("{host}:default"),
    }
}

pub struct Worker {
    store: Arc<dyn Store>,
    data_root: DataRoot,
    config: WorkerConfig,
    worker_id: String,
    hostname: String,
}

impl Worker {
    pub fn new(store: Arc<dyn Store>, data_root: DataRoot, config: WorkerConfig) -> Self {
        let hostname = local_hostname();
        let worker_id = derive_worker_id(&hostname, config.gpu_index);
        Self {
            store,
            data_root,
            config,
            worker_id,
            hostname,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Run until drained or forced. Registers on entry, reaps orphans left
    /// by crashed workers, then claims and supervises jobs serially.
    pub async fn run(&self, shutdown: &Shutdown) -> Result<()> {
        let requeued = self.store.reap_expired(Utc::now()).await?;
        for job_id in &requeued {
            tracing::warn!(job_id, "requeued orphaned job");
        }

        self.store
            .register_worker(
                &self.worker_id,
                &self.hostname,
                Some(std::process::id() as i32),
                self.config.gpu_index.map(i64::from),
            )
            .await?;
        tracing::info!(worker_id = %self.worker_id, "worker started");

        let supervisor = Supervisor::new(&self.config);
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(60));

        let result = loop {
            if shutdown.drain_requested() || shutdown.force_requested() {
                break Ok(());
            }

            let claimed = match self
                .store
                .claim_next(&self.worker_id, self.config.lease_seconds)
                .await
            {
                Ok(claimed) => {
                    backoff.reset();
                    claimed
                }
                Err(e @ WhirrError::StoreUnavailable(_)) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in = ?delay, "claim failed");
                    sleep_until_drain(delay, shutdown).await;
                    continue;
                }
                Err(e) => break Err(e),
            };

            let Some(job) = claimed else {
                sleep_until_drain(self.config.poll_interval, shutdown).await;
                continue;
            };

            tracing::info!(
                job_id = job.id,
                name = job.name.as_deref().unwrap_or(&job.command_argv[0]),
                attempt = job.attempt,
                "claimed job"
            );
            if let Err(e) = self.process_job(&supervisor, &job, shutdown).await {
                // Failed run-state writes stop the worker.
                break Err(e);
            }
        };

        if let Err(e) = self
            .store
            .set_worker_state(&self.worker_id, WorkerState::Stopped, None)
            .await
        {
            tracing::warn!(error = %e, "failed to mark worker stopped");
        }
        tracing::info!(worker_id = %self.worker_id, "worker stopped");
        result
    }

    async fn process_job(
        &self,
        supervisor: &Supervisor,
        job: &ClaimedJob,
        shutdown: &Shutdown,
    ) -> Result<()> {
        if let Err(e) = self
            .store
            .set_worker_state(&self.worker_id, WorkerState::Busy, Some(job.id))
            .await
        {
            tracing::warn!(error = %e, "failed to mark worker busy");
        }

        let run_dir = RunDir::create(&self.data_root.runs_dir(), &job.run_id)?;
        if let Some(config) = &job.config {
            run_dir.write_config(config)?;
        }
        let mut meta = RunMeta {
            run_id: job.run_id.clone(),
            name: job.name.clone(),
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_seconds: None,
            tags: job.tags.clone(),
            config_file: "config.json".to_string(),
            summary: None,
            git_info: capture_git_info(Path::new(&job.workdir)),
            exit_code: None,
        };
        run_dir.write_meta(&meta)?;

        let outcome = supervisor
            .run(self.store.as_ref(), &self.worker_id, job, &run_dir, shutdown)
            .await?;

        match outcome {
            Supervised::Abandoned => {
                tracing::warn!(job_id = job.id, "job abandoned after lease loss");
            }
            Supervised::Finished { exit_code, status } => {
                let finished_at = Utc::now();
                meta.status = status.into();
                meta.finished_at = Some(finished_at);
                meta.duration_seconds =
                    Some((finished_at - meta.started_at).num_milliseconds() as f64 / 1000.0);
                meta.exit_code = Some(exit_code);
                run_dir.write_meta(&meta)?;

                let error_message = match status {
                    TerminalStatus::Completed => None,
                    TerminalStatus::Cancelled => Some("job cancelled".to_string()),
                    TerminalStatus::Failed => Some(format!("exit code {exit_code}")),
                };
                match self
                    .store
                    .complete(
                        job.id,
                        &self.worker_id,
                        exit_code,
                        status,
                        error_message.as_deref(),
                    )
                    .await
                {
                    Ok(()) => {}
                    Err(WhirrError::NotOwner { .. }) => {
                        tracing::warn!(job_id = job.id, "job no longer owned at completion");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = job.id, error = %e, "failed to report completion");
                    }
                }

                match status {
                    TerminalStatus::Completed => {
                        tracing::info!(job_id = job.id, "job completed");
                    }
                    TerminalStatus::Cancelled => {
                        tracing::warn!(job_id = job.id, exit_code, "job cancelled");
                    }
                    TerminalStatus::Failed => {
                        tracing::warn!(job_id = job.id, exit_code, "job failed");
                    }
                }
            }
        }

        if let Err(e) = self
            .store
            .set_worker_state(&self.worker_id, WorkerState::Idle, None)
            .await
        {
            tracing::warn!(error = %e, "failed to mark worker idle");
        }
        Ok(())
    }
}

async fn sleep_until_drain(duration: Duration, shutdown: &Shutdown) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.drained() => {}
    }
}
