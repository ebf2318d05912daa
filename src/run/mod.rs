//! On-disk run layout under `<data_root>/runs/<run_id>/`.
//!
//! The filesystem is the authoritative record of a run. Every file has a
//! single writer: the supervisor owns `output.log` and `meta.json`, the
//! user-side logging library owns `metrics.jsonl`, `system.jsonl`,
//! `config.json` and `artifacts/`. Readers are concurrent and must tolerate
//! a truncated trailing JSONL record.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Command;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, WhirrError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl From<crate::store::TerminalStatus> for RunStatus {
    fn from(t: crate::store::TerminalStatus) -> Self {
        use crate::store::TerminalStatus;
        match t {
            TerminalStatus::Completed => RunStatus::Completed,
            TerminalStatus::Failed => RunStatus::Failed,
            TerminalStatus::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Contents of `meta.json`. Optional fields are omitted when absent so the
/// serialized object round-trips bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub config_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_info: Option<GitInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub dirty: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactEntry {
    pub path: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Handle on one run's directory.
#[derive(Debug, Clone)]
pub struct RunDir {
    dir: PathBuf,
}

impl RunDir {
    /// Create the directory skeleton (including `artifacts/`) if absent.
    pub fn create(runs_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = runs_dir.join(run_id);
        fs::create_dir_all(dir.join("artifacts"))?;
        Ok(Self { dir })
    }

    /// Open an existing run directory.
    pub fn open(runs_dir: &Path, run_id: &str) -> Result<Self> {
        let dir = runs_dir.join(run_id);
        if !dir.is_dir() {
            return Err(WhirrError::NotFound(format!("run {run_id}")));
        }
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    pub fn config_path(&self) -> PathBuf {
        self.dir.join("config.json")
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.dir.join("metrics.jsonl")
    }

    pub fn output_log_path(&self) -> PathBuf {
        self.dir.join("output.log")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join("artifacts")
    }

    pub fn write_meta(&self, meta: &RunMeta) -> Result<()> {
        let mut body = serde_json::to_string_pretty(meta)?;
        body.push('\n');
        fs::write(self.meta_path(), body)?;
        Ok(())
    }

    pub fn read_meta(&self) -> Result<RunMeta> {
        let body = fs::read_to_string(self.meta_path())?;
        Ok(serde_json::from_str(&body)?)
    }

    pub fn write_config(&self, config: &serde_json::Value) -> Result<()> {
        let mut body = serde_json::to_string_pretty(config)?;
        body.push('\n');
        fs::write(self.config_path(), body)?;
        Ok(())
    }

    /// Recursively list `artifacts/`, paths relative to it.
    pub fn list_artifacts(&self) -> Result<Vec<ArtifactEntry>> {
        let root = self.artifacts_dir();
        let mut entries = Vec::new();
        if root.is_dir() {
            walk_artifacts(&root, &root, &mut entries)?;
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Resolve a relative artifact path, rejecting anything that would
    /// escape `artifacts/`.
    pub fn resolve_artifact(&self, relpath: &str) -> Option<PathBuf> {
        let rel = Path::new(relpath);
        if rel.components().any(|c| {
            !matches!(c, std::path::Component::Normal(_))
        }) {
            return None;
        }
        let full = self.artifacts_dir().join(rel);
        full.is_file().then_some(full)
    }
}

fn walk_artifacts(root: &Path, dir: &Path, out: &mut Vec<ArtifactEntry>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_artifacts(root, &path, out)?;
        } else if let Ok(md) = entry.metadata() {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .into_owned();
            let modified = md
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            out.push(ArtifactEntry {
                path: rel,
                size: md.len(),
                modified,
            });
        }
    }
    Ok(())
}

/// Read a JSONL metrics file, treating an unparsable final line as EOF.
/// A writer crash can leave a partial record; readers never surface it.
pub fn read_jsonl(path: &Path) -> Result<Vec<serde_json::Value>> {
    let mut records = Vec::new();
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(records),
        Err(e) => return Err(e.into()),
    };
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => records.push(value),
            Err(_) => break,
        }
    }
    Ok(records)
}

/// Run id for a directly-initialized run: `local-<YYYYMMDD-HHMMSS>-<4 hex>`.
pub fn local_run_id(now: DateTime<Utc>) -> String {
    let suffix: u16 = rand::random();
    format!("local-{}-{:04x}", now.format("%Y%m%d-%H%M%S"), suffix)
}

/// Best-effort snapshot of the git state of a workdir. Absence of git, or a
/// workdir outside any repository, yields `None`.
pub fn capture_git_info(workdir: &Path) -> Option<GitInfo> {
    let commit = git_output(workdir, &["rev-parse", "HEAD"])?;
    let branch = git_output(workdir, &["rev-parse", "--abbrev-ref", "HEAD"]);
    let dirty = git_output(workdir, &["status", "--porcelain"])
        .map(|s| !s.is_empty())
        .unwrap_or(false);
    let remote_url = git_output(workdir, &["remote", "get-url", "origin"]);
    Some(GitInfo {
        commit: Some(commit),
        branch,
        dirty,
        remote_url,
    })
}

fn git_output(workdir: &Path, args: &[&str]) -> Option<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(workdir)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
    (!s.is_empty()).then_some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn jsonl_reader_tolerates_truncated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "{{\"_idx\":0,\"loss\":1.0}}").unwrap();
        writeln!(f, "{{\"_idx\":1,\"loss\":0.5}}").unwrap();
        write!(f, "{{\"_idx\":2,\"lo").unwrap();
        drop(f);

        let records = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1]["_idx"], 1);
    }

    #[test]
    fn jsonl_reader_handles_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let records = read_jsonl(&dir.path().join("absent.jsonl")).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn artifact_resolution_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let run = RunDir::create(dir.path(), "job-1").unwrap();
        fs::write(run.artifacts_dir().join("model.pt"), b"weights").unwrap();

        assert!(run.resolve_artifact("model.pt").is_some());
        assert!(run.resolve_artifact("../meta.json").is_none());
        assert!(run.resolve_artifact("/etc/passwd").is_none());
    }

    #[test]
    fn local_run_ids_carry_timestamp_and_suffix() {
        let now = Utc::now();
        let id = local_run_id(now);
        assert!(id.starts_with("local-"));
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[3].len(), 4);
    }
}
