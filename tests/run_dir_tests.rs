use std::fs;
use std::io::Write;

use chrono::Utc;
use tempfile::TempDir;

use whirr::run::{read_jsonl, RunDir, RunMeta, RunStatus};

fn meta_fixture() -> RunMeta {
    RunMeta {
        run_id: "job-7".into(),
        name: Some("baseline".into()),
        status: RunStatus::Running,
        started_at: Utc::now(),
        finished_at: None,
        duration_seconds: None,
        tags: vec!["sweep".into()],
        config_file: "config.json".into(),
        summary: None,
        git_info: None,
        exit_code: None,
    }
}

#[test]
fn meta_round_trips_exactly() {
    let dir = TempDir::new().unwrap();
    let run = RunDir::create(dir.path(), "job-7").unwrap();

    let meta = meta_fixture();
    run.write_meta(&meta).unwrap();
    let read = run.read_meta().unwrap();
    assert_eq!(read, meta);

    // Rewriting the same value yields byte-identical content.
    let first = fs::read(run.meta_path()).unwrap();
    run.write_meta(&read).unwrap();
    let second = fs::read(run.meta_path()).unwrap();
    assert_eq!(first, second);
}

#[test]
fn meta_terminal_fields_round_trip() {
    let dir = TempDir::new().unwrap();
    let run = RunDir::create(dir.path(), "job-8").unwrap();

    let mut meta = meta_fixture();
    meta.status = RunStatus::Failed;
    meta.finished_at = Some(Utc::now());
    meta.duration_seconds = Some(12.5);
    meta.exit_code = Some(3);
    meta.summary = Some(serde_json::json!({"loss": 0.125}));
    run.write_meta(&meta).unwrap();

    let read = run.read_meta().unwrap();
    assert_eq!(read, meta);

    // Absent optionals stay absent in the serialized object.
    let raw: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(run.meta_path()).unwrap()).unwrap();
    assert!(raw.get("git_info").is_none());
    assert_eq!(raw["exit_code"], 3);
}

#[test]
fn metric_indices_are_contiguous_from_zero() {
    let dir = TempDir::new().unwrap();
    let run = RunDir::create(dir.path(), "job-9").unwrap();

    let mut f = fs::File::create(run.metrics_path()).unwrap();
    for idx in 0..100 {
        writeln!(
            f,
            "{}",
            serde_json::json!({"_idx": idx, "_timestamp": "2026-01-01T00:00:00Z", "loss": 1.0 / (idx + 1) as f64})
        )
        .unwrap();
    }
    drop(f);

    let records = read_jsonl(&run.metrics_path()).unwrap();
    assert_eq!(records.len(), 100);
    for (expected, record) in records.iter().enumerate() {
        assert_eq!(record["_idx"], expected as u64);
    }
}

#[test]
fn reader_drops_record_truncated_mid_write() {
    let dir = TempDir::new().unwrap();
    let run = RunDir::create(dir.path(), "job-10").unwrap();

    let mut f = fs::File::create(run.metrics_path()).unwrap();
    for idx in 0..999 {
        writeln!(f, "{}", serde_json::json!({"_idx": idx, "step": idx})).unwrap();
    }
    // The 1000th record is cut off mid-line, as a crash would leave it.
    write!(f, "{{\"_idx\": 999, \"st").unwrap();
    drop(f);

    let records = read_jsonl(&run.metrics_path()).unwrap();
    assert_eq!(records.len(), 999);
    assert_eq!(records.last().unwrap()["_idx"], 998);
}

#[test]
fn artifacts_listing_walks_subdirectories() {
    let dir = TempDir::new().unwrap();
    let run = RunDir::create(dir.path(), "job-11").unwrap();

    fs::write(run.artifacts_dir().join("model.pt"), b"weights").unwrap();
    fs::create_dir_all(run.artifacts_dir().join("checkpoints")).unwrap();
    fs::write(
        run.artifacts_dir().join("checkpoints/epoch-1.pt"),
        b"more weights",
    )
    .unwrap();

    let entries = run.list_artifacts().unwrap();
    let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
    assert_eq!(paths, vec!["checkpoints/epoch-1.pt", "model.pt"]);
    assert_eq!(entries[1].size, 7);
}

#[test]
fn open_of_missing_run_fails() {
    let dir = TempDir::new().unwrap();
    assert!(RunDir::open(dir.path(), "job-404").is_err());
}
