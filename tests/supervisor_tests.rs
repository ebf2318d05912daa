use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use whirr::config::{DataRoot, WorkerConfig};
use whirr::run::RunDir;
use whirr::shutdown::Shutdown;
use whirr::store::{ClaimedJob, JobSpec, SqliteStore, Store, TerminalStatus};
use whirr::worker::supervisor::{Supervised, Supervisor, STARTUP_FAILURE_EXIT_CODE};

const WORKER_ID: &str = "testhost:default";

fn fast_config() -> WorkerConfig {
    WorkerConfig {
        poll_interval: Duration::from_millis(100),
        heartbeat_interval: Duration::from_millis(200),
        lease_seconds: 60,
        grace_period: Duration::from_secs(1),
        gpu_index: None,
    }
}

struct Fixture {
    store: Arc<SqliteStore>,
    root: DataRoot,
    _dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = DataRoot::create(dir.path()).unwrap();
    let store = Arc::new(SqliteStore::open(&root).unwrap());
    Fixture {
        store,
        root,
        _dir: dir,
    }
}

async fn claim(fx: &Fixture, argv: &[&str], workdir: &str) -> (ClaimedJob, RunDir) {
    let spec = JobSpec::new(argv.iter().map(|s| s.to_string()).collect(), workdir);
    fx.store.enqueue(spec).await.unwrap();
    let job = fx.store.claim_next(WORKER_ID, 60).await.unwrap().unwrap();
    let run_dir = RunDir::create(&fx.root.runs_dir(), &job.run_id).unwrap();
    (job, run_dir)
}

#[tokio::test]
async fn child_output_is_captured_and_zero_exit_completes() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/bin/sh", "-c", "echo hello"], "/tmp").await;
    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();

    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Supervised::Finished {
            exit_code: 0,
            status: TerminalStatus::Completed,
        }
    );
    let log = fs::read_to_string(run_dir.output_log_path()).unwrap();
    assert_eq!(log, "hello\n");
}

#[tokio::test]
async fn nonzero_exit_fails_with_code_preserved() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/bin/sh", "-c", "exit 3"], "/tmp").await;
    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();

    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Supervised::Finished {
            exit_code: 3,
            status: TerminalStatus::Failed,
        }
    );
}

#[tokio::test]
async fn missing_workdir_is_a_contained_startup_failure() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/bin/true"], "/nonexistent/workdir").await;
    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();

    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Supervised::Finished {
            exit_code: STARTUP_FAILURE_EXIT_CODE,
            status: TerminalStatus::Failed,
        }
    );
    let log = fs::read_to_string(run_dir.output_log_path()).unwrap();
    assert!(log.contains("workdir does not exist"));
}

#[tokio::test]
async fn unknown_executable_is_a_contained_startup_failure() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/no/such/binary"], "/tmp").await;
    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();

    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Supervised::Finished {
            exit_code: STARTUP_FAILURE_EXIT_CODE,
            status: TerminalStatus::Failed,
        }
    );
    let log = fs::read_to_string(run_dir.output_log_path()).unwrap();
    assert!(log.contains("spawn failed"));
}

#[tokio::test]
async fn cancellation_terminates_the_whole_process_group() {
    let fx = fixture();
    // The inner `sleep 43210` is a grandchild; only a group-wide signal
    // reaches it.
    let (job, run_dir) = claim(
        &fx,
        &["/bin/sh", "-c", "sleep 43210 & exec sleep 43211"],
        "/tmp",
    )
    .await;
    fx.store.request_cancel(job.id).await.unwrap();

    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();
    let started = Instant::now();
    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    match outcome {
        Supervised::Finished { exit_code, status } => {
            assert_eq!(status, TerminalStatus::Cancelled);
            assert_ne!(exit_code, 0);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(15));

    let survivors = std::process::Command::new("pgrep")
        .args(["-f", "sleep 43210"])
        .status()
        .unwrap();
    assert!(!survivors.success(), "grandchild survived group kill");
}

#[tokio::test]
async fn sigterm_ignorer_is_killed_after_the_grace_window() {
    let fx = fixture();
    let (job, run_dir) = claim(
        &fx,
        &["/bin/sh", "-c", "trap '' TERM; sleep 60 & wait"],
        "/tmp",
    )
    .await;
    fx.store.request_cancel(job.id).await.unwrap();

    let config = fast_config();
    let supervisor = Supervisor::new(&config);
    let shutdown = Shutdown::unarmed();
    let started = Instant::now();
    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    let elapsed = started.elapsed();
    match outcome {
        Supervised::Finished { status, .. } => assert_eq!(status, TerminalStatus::Cancelled),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(elapsed >= config.grace_period);
    assert!(elapsed < Duration::from_secs(20));
}

#[tokio::test]
async fn force_shutdown_terminates_the_child() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/bin/sh", "-c", "sleep 60"], "/tmp").await;

    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();
    shutdown.request_force();

    let started = Instant::now();
    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    match outcome {
        Supervised::Finished { status, .. } => assert_eq!(status, TerminalStatus::Cancelled),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn drain_does_not_disturb_the_running_child() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/bin/sh", "-c", "sleep 1; echo done"], "/tmp").await;

    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();
    shutdown.request_drain();

    let outcome = supervisor
        .run(fx.store.as_ref(), WORKER_ID, &job, &run_dir, &shutdown)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        Supervised::Finished {
            exit_code: 0,
            status: TerminalStatus::Completed,
        }
    );
    let log = fs::read_to_string(run_dir.output_log_path()).unwrap();
    assert!(log.contains("done"));
}

#[tokio::test]
async fn lease_loss_abandons_the_job() {
    let fx = fixture();
    let (job, run_dir) = claim(&fx, &["/bin/sh", "-c", "sleep 60"], "/tmp").await;

    let supervisor = Supervisor::new(&fast_config());
    let shutdown = Shutdown::unarmed();
    // Renewals from a different worker id are rejected as NotOwner, the same
    // signal a reaped-and-reclaimed job produces.
    let outcome = supervisor
        .run(fx.store.as_ref(), "intruder:default", &job, &run_dir, &shutdown)
        .await
        .unwrap();

    assert_eq!(outcome, Supervised::Abandoned);
}
