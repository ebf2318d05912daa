use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WhirrError};

pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_LEASE_SECONDS: i64 = 60;
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 10;

/// Heartbeats older than this requeue a job in embedded mode, where there is
/// no lease clock shared between workers.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i64 = 120;

/// Tunables for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    pub lease_seconds: i64,
    pub grace_period: Duration,
    /// Accelerator index this worker is pinned to, if any.
    pub gpu_index: Option<u32>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            lease_seconds: DEFAULT_LEASE_SECONDS,
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            gpu_index: None,
        }
    }
}

/// On-disk layout under the data root: the embedded database file and the
/// per-run directories.
#[derive(Debug, Clone)]
pub struct DataRoot {
    root: PathBuf,
}

impl DataRoot {
    /// Open an existing data root. The directory must already exist; workers
    /// and servers never create it implicitly.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(WhirrError::NotInitialized(root.display().to_string()));
        }
        Ok(Self { root })
    }

    /// Create the data root and its runs directory if absent.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("runs"))?;
        Ok(Self { root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("whirr.db")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }
}
