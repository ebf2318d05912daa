use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use whirr::config::{DataRoot, WorkerConfig};
use whirr::error::WhirrError;
use whirr::server::{serve, AppState};
use whirr::shutdown::Shutdown;
use whirr::store::{HttpStore, JobSpec, PgStore, SqliteStore, Store};
use whirr::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "whirr")]
#[command(version, about = "Job orchestration for machine-learning experiments")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a worker that claims and executes queued jobs
    Worker(WorkerArgs),
    /// Run the HTTP server fronting the store for multi-host setups
    Server(ServerArgs),
    /// Submit a command to the queue
    Submit(SubmitArgs),
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Server URL for networked mode (e.g. http://head-node:8080)
    #[arg(short, long, env = "WHIRR_SERVER_URL")]
    server: Option<String>,

    /// Data directory holding the database and run outputs
    #[arg(short, long, env = "WHIRR_DATA_DIR")]
    data_dir: PathBuf,

    /// Accelerator index to pin this worker to
    #[arg(short, long)]
    gpu: Option<u32>,

    /// Seconds between claim attempts when the queue is empty
    #[arg(long, default_value_t = 5)]
    poll_interval: u64,

    /// Seconds between lease renewals while a job runs
    #[arg(long, default_value_t = 30)]
    heartbeat_interval: u64,

    /// Lease duration granted on claim and renewal
    #[arg(long, default_value_t = 60)]
    lease_seconds: i64,

    /// Seconds between SIGTERM and SIGKILL on termination
    #[arg(long, default_value_t = 10)]
    grace_period: u64,
}

#[derive(Args, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Data directory on the shared filesystem
    #[arg(short, long, env = "WHIRR_DATA_DIR")]
    data_dir: PathBuf,

    /// PostgreSQL URL; the embedded database is used when absent
    #[arg(long, env = "WHIRR_DATABASE_URL")]
    database_url: Option<String>,
}

#[derive(Args, Debug)]
struct SubmitArgs {
    /// Server URL for networked mode; local database when absent
    #[arg(short, long, env = "WHIRR_SERVER_URL")]
    server: Option<String>,

    /// Data directory (embedded mode)
    #[arg(short, long, env = "WHIRR_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Human-readable job name
    #[arg(short, long)]
    name: Option<String>,

    /// Tag to attach; repeatable
    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Working directory for the job (defaults to the current directory)
    #[arg(short, long)]
    workdir: Option<PathBuf>,

    /// Inline JSON configuration stored alongside the run
    #[arg(short, long)]
    config: Option<String>,

    /// The command and its arguments, executed without a shell
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!(error = %e, "whirr failed");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Worker(args) => run_worker(args).await,
        Command::Server(args) => run_server(args).await,
        Command::Submit(args) => run_submit(args).await,
    }
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let data_root = DataRoot::open(&args.data_dir)?;
    let store: Arc<dyn Store> = match &args.server {
        Some(url) => Arc::new(HttpStore::new(url)?),
        None => Arc::new(SqliteStore::open(&data_root)?),
    };

    let config = WorkerConfig {
        poll_interval: Duration::from_secs(args.poll_interval),
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval),
        lease_seconds: args.lease_seconds,
        grace_period: Duration::from_secs(args.grace_period),
        gpu_index: args.gpu,
    };

    let shutdown = Shutdown::install()?;
    let worker = Worker::new(store, data_root, config);
    worker.run(&shutdown).await?;
    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let data_root = DataRoot::create(&args.data_dir)?;
    let store: Arc<dyn Store> = match &args.database_url {
        Some(url) => Arc::new(PgStore::connect(url, &data_root).await?),
        None => Arc::new(SqliteStore::open(&data_root)?),
    };

    let shutdown = Shutdown::install()?;
    let state = AppState { store, data_root };
    serve(args.listen, state, shutdown.drain_token()).await?;
    Ok(())
}

async fn run_submit(args: SubmitArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store: Arc<dyn Store> = match &args.server {
        Some(url) => Arc::new(HttpStore::new(url)?),
        None => {
            let data_dir = args
                .data_dir
                .clone()
                .ok_or_else(|| WhirrError::NotInitialized("--data-dir required".into()))?;
            Arc::new(SqliteStore::open(&DataRoot::open(data_dir)?)?)
        }
    };

    let workdir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let config: Option<serde_json::Value> = args
        .config
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| WhirrError::InvalidSpec(format!("config is not valid JSON: {e}")))?;

    let spec = JobSpec {
        command_argv: args.command,
        workdir: workdir.display().to_string(),
        name: args.name,
        tags: args.tags,
        config,
        parent_job_id: None,
    };
    let receipt = store.enqueue(spec).await?;
    println!("job {} queued (run {})", receipt.job_id, receipt.run_id);
    Ok(())
}
