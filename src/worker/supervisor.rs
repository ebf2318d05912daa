//! Child-process supervision.
//!
//! The child is the leader of a fresh process group so one signal reaches
//! its whole descendant tree, and on Linux it additionally dies with the
//! supervising process via `PR_SET_PDEATHSIG`. Merged stdout/stderr go to
//! `output.log`. Termination is cooperative first (SIGTERM to the group),
//! forceful after the grace window (SIGKILL to the group).

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};

use crate::config::WorkerConfig;
use crate::error::{Result, WhirrError};
use crate::run::RunDir;
use crate::shutdown::Shutdown;
use crate::store::{ClaimedJob, Store, TerminalStatus};

/// Startup failures (missing workdir, exec errors) finish with this code.
pub const STARTUP_FAILURE_EXIT_CODE: i32 = -1;

/// How often the supervision loop wakes to check the child and the flags.
const WAIT_TICK: Duration = Duration::from_millis(500);

/// Upper bound on waiting for the group to disappear after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Supervised {
    /// The job ran to a terminal state and should be finalized.
    Finished {
        exit_code: i32,
        status: TerminalStatus,
    },
    /// The lease was lost mid-run. The child has been terminated and no
    /// further state may be written for this job.
    Abandoned,
}

pub struct Supervisor {
    heartbeat_interval: Duration,
    lease_seconds: i64,
    grace_period: Duration,
    gpu_index: Option<u32>,
}

impl Supervisor {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            heartbeat_interval: config.heartbeat_interval,
            lease_seconds: config.lease_seconds,
            grace_period: config.grace_period,
            gpu_index: config.gpu_index,
        }
    }

    /// Run one claimed job to a terminal state.
    ///
    /// Startup failures are contained here: they finalize as `failed` with
    /// the sentinel exit code and an explanation in `output.log`, never as
    /// an error to the caller.
    pub async fn run(
        &self,
        store: &dyn Store,
        worker_id: &str,
        job: &ClaimedJob,
        run_dir: &RunDir,
        shutdown: &Shutdown,
    ) -> Result<Supervised> {
        let log_path = run_dir.output_log_path();
        let mut log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let workdir = Path::new(&job.workdir);
        if !workdir.is_dir() {
            return startup_failure(
                &mut log,
                format!("workdir does not exist: {}", job.workdir),
            );
        }

        let mut child = match self.spawn(job, workdir, &log, run_dir) {
            Ok(child) => child,
            Err(e) => return startup_failure(&mut log, format!("spawn failed: {e}")),
        };

        // The child is its own group leader, so its pid doubles as the pgid.
        let pgid = match child.id() {
            Some(pid) => Pid::from_raw(pid as i32),
            None => return startup_failure(&mut log, "child exited before supervision".into()),
        };
        let mut guard = GroupKillGuard::armed(pgid);

        let mut cancel_observed = false;
        let mut next_renew = Instant::now() + self.heartbeat_interval;
        let mut backoff = Backoff::new(Duration::from_secs(1), self.heartbeat_interval);

        loop {
            match timeout(WAIT_TICK, child.wait()).await {
                Ok(Ok(status)) => {
                    guard.disarm();
                    let exit_code = exit_code_of(status);
                    let status = if cancel_observed {
                        TerminalStatus::Cancelled
                    } else if exit_code == 0 {
                        TerminalStatus::Completed
                    } else {
                        TerminalStatus::Failed
                    };
                    return Ok(Supervised::Finished { exit_code, status });
                }
                Ok(Err(e)) => {
                    tracing::error!(job_id = job.id, error = %e, "waiting on child failed");
                    let exit_code = self.terminate(&mut child, pgid).await;
                    guard.disarm();
                    return Ok(Supervised::Finished {
                        exit_code,
                        status: TerminalStatus::Failed,
                    });
                }
                Err(_) => {}
            }

            if shutdown.force_requested() || cancel_observed {
                let exit_code = self.terminate(&mut child, pgid).await;
                guard.disarm();
                return Ok(Supervised::Finished {
                    exit_code,
                    status: TerminalStatus::Cancelled,
                });
            }

            if Instant::now() >= next_renew {
                match store.renew(job.id, worker_id, self.lease_seconds).await {
                    Ok(ack) => {
                        backoff.reset();
                        next_renew = Instant::now() + self.heartbeat_interval;
                        if ack.cancel_requested {
                            tracing::info!(job_id = job.id, "cancellation observed via heartbeat");
                            cancel_observed = true;
                        }
                    }
                    Err(WhirrError::NotOwner { .. }) => {
                        tracing::warn!(
                            job_id = job.id,
                            "lease lost, terminating child and abandoning job"
                        );
                        self.terminate(&mut child, pgid).await;
                        guard.disarm();
                        return Ok(Supervised::Abandoned);
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        tracing::warn!(
                            job_id = job.id,
                            error = %e,
                            retry_in = ?delay,
                            "heartbeat failed"
                        );
                        next_renew = Instant::now() + delay;
                    }
                }
            }
        }
    }

    fn spawn(
        &self,
        job: &ClaimedJob,
        workdir: &Path,
        log: &std::fs::File,
        run_dir: &RunDir,
    ) -> std::io::Result<Child> {
        let stdout = log.try_clone()?;
        let stderr = log.try_clone()?;

        let mut cmd = Command::new(&job.command_argv[0]);
        cmd.args(&job.command_argv[1..])
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .env("WHIRR_JOB_ID", job.id.to_string())
            .env("WHIRR_RUN_ID", &job.run_id)
            .env("WHIRR_RUN_DIR", run_dir.path())
            .process_group(0);
        if let Some(gpu) = self.gpu_index {
            cmd.env("CUDA_VISIBLE_DEVICES", gpu.to_string());
        }

        // If the worker dies without unwinding (SIGKILL), the kernel delivers
        // SIGKILL to the child; elsewhere the orphan reaper is the recourse.
        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                let _ = nix::sys::prctl::set_pdeathsig(Signal::SIGKILL);
                Ok(())
            });
        }

        cmd.spawn()
    }

    /// SIGTERM the group, give it the grace window, then SIGKILL the group.
    async fn terminate(&self, child: &mut Child, pgid: Pid) -> i32 {
        let _ = killpg(pgid, Signal::SIGTERM);
        if let Ok(Ok(status)) = timeout(self.grace_period, child.wait()).await {
            return exit_code_of(status);
        }
        let _ = killpg(pgid, Signal::SIGKILL);
        match timeout(KILL_WAIT, child.wait()).await {
            Ok(Ok(status)) => exit_code_of(status),
            _ => -(Signal::SIGKILL as i32),
        }
    }
}

/// A signal-killed child reports the negated signal number.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| -sig))
        .unwrap_or(STARTUP_FAILURE_EXIT_CODE)
}

fn startup_failure(log: &mut std::fs::File, message: String) -> Result<Supervised> {
    tracing::error!(error = %message, "job startup failed");
    let _ = writeln!(log, "whirr: {message}");
    Ok(Supervised::Finished {
        exit_code: STARTUP_FAILURE_EXIT_CODE,
        status: TerminalStatus::Failed,
    })
}

/// Last-resort cleanup: if supervision unwinds without reaching a terminal
/// state, the whole group is SIGKILLed on drop.
struct GroupKillGuard {
    pgid: Option<Pid>,
}

impl GroupKillGuard {
    fn armed(pgid: Pid) -> Self {
        Self { pgid: Some(pgid) }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for GroupKillGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            let _ = killpg(pgid, Signal::SIGKILL);
        }
    }
}

/// Bounded exponential backoff for transient store failures.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }
}
