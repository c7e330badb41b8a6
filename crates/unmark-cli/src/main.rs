use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};

use unmark::batch::jobs_for_directory;
use unmark::bundle::{create_bundle, DEFAULT_MAX_BUNDLE_SIZE};
use unmark::db::Database;
use unmark::job::{JobId, JobStatus};
use unmark::{init_logging, load_config, LogFormat, ServiceConfig, SqliteJobStore, WatermarkService};

#[derive(Parser, Debug)]
#[command(name = "unmark", version)]
#[command(about = "Schedule and run watermark removal jobs", long_about = None)]
struct Cli {
    /// Log output format: human or json
    #[arg(long, global = true, default_value = "human", env = "UNMARK_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every matching video in a directory with bounded concurrency
    Batch(BatchArgs),
    /// Submit files through the worker pool and wait for them
    Process(ProcessArgs),
    /// Zip the outputs of finished jobs
    Bundle(BundleArgs),
}

#[derive(Args, Debug)]
struct BatchArgs {
    #[arg(long)]
    input_dir: PathBuf,

    #[arg(long)]
    output_dir: PathBuf,

    /// Maximum jobs running at once (defaults to batch.concurrency_limit)
    #[arg(long)]
    concurrent: Option<usize>,

    #[arg(long, default_value = "*.mp4")]
    pattern: String,

    /// Per-job wall-clock budget in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    #[arg(long, env = "UNMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Where to write the JSON report (defaults to <output-dir>/batch_results.json)
    #[arg(long)]
    results: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct ProcessArgs {
    #[arg(required = true)]
    files: Vec<PathBuf>,

    #[arg(long, env = "UNMARK_CONFIG")]
    config: Option<PathBuf>,

    /// Lower runs first
    #[arg(long, default_value_t = 0)]
    priority: i32,
}

#[derive(Args, Debug)]
struct BundleArgs {
    #[arg(long)]
    database: PathBuf,

    #[arg(long)]
    out: PathBuf,

    #[arg(long, default_value_t = DEFAULT_MAX_BUNDLE_SIZE)]
    max: usize,

    #[arg(required = true)]
    ids: Vec<String>,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match cli.command {
        Command::Batch(args) => run_batch(args),
        Command::Process(args) => run_process(args),
        Command::Bundle(args) => run_bundle(args),
    }
}

fn read_config(path: Option<&Path>) -> Result<ServiceConfig> {
    match path {
        Some(path) => load_config(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ServiceConfig::default()),
    }
}

fn run_batch(args: BatchArgs) -> Result<ExitCode> {
    let config = read_config(args.config.as_deref())?;
    let mut batch_config = config.batch.clone();
    if args.timeout_secs.is_some() {
        batch_config.job_timeout_secs = args.timeout_secs;
    }
    let concurrency = args.concurrent.unwrap_or(batch_config.concurrency_limit);

    let jobs = jobs_for_directory(&args.input_dir, &args.output_dir, &args.pattern)?;
    if jobs.is_empty() {
        warn!(
            "No files matching '{}' in {}",
            args.pattern,
            args.input_dir.display()
        );
        return Ok(ExitCode::SUCCESS);
    }
    std::fs::create_dir_all(&args.output_dir)
        .with_context(|| format!("Failed to create {}", args.output_dir.display()))?;

    let service = Arc::new(WatermarkService::from_config(config)?);
    let coordinator = service.batch_coordinator(&batch_config);
    let plan = coordinator.admit(jobs, concurrency)?;
    info!(
        batch_id = plan.batch_id(),
        total = plan.len(),
        concurrency,
        "Starting batch"
    );

    let ids = plan.job_ids();
    let on_interrupt = Arc::clone(&service);
    ctrlc::set_handler(move || {
        warn!("Interrupted, cancelling outstanding jobs");
        if let Err(e) = on_interrupt.cancel_tasks(&ids) {
            error!("Cancellation failed: {}", e);
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let result = runtime.block_on(coordinator.run(plan));

    let results_path = args
        .results
        .unwrap_or_else(|| args.output_dir.join("batch_results.json"));
    result
        .save(&results_path)
        .with_context(|| format!("Failed to write {}", results_path.display()))?;

    let stats = &result.stats;
    info!(
        "Batch {}: {} completed, {} failed, {} cancelled in {:.1}s ({:.2} jobs/min, peak {} concurrent)",
        result.batch_id,
        stats.completed,
        stats.failed,
        stats.cancelled,
        stats.elapsed_seconds,
        stats.throughput_per_minute,
        stats.peak_concurrency
    );
    for failed in &result.failed {
        error!(job_id = %failed.job.id, "Failed: {}", failed.error);
    }
    info!("Results saved to {}", results_path.display());

    Ok(if result.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn run_process(args: ProcessArgs) -> Result<ExitCode> {
    let config = read_config(args.config.as_deref())?;
    let service = Arc::new(WatermarkService::from_config(config)?);
    service.start()?;

    let mut ids = Vec::with_capacity(args.files.len());
    for file in &args.files {
        if !file.is_file() {
            bail!("{} is not a file", file.display());
        }
        let job = service.create_job(args.priority)?;
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let upload = service.upload_path(&name);
        if let Err(e) = std::fs::copy(file, &upload) {
            service.mark_error(&job.id, &format!("Upload failed: {}", e))?;
            continue;
        }
        service.queue_job(&job.id, &upload)?;
        ids.push(job.id);
    }

    let on_interrupt = Arc::clone(&service);
    let pending = ids.clone();
    ctrlc::set_handler(move || {
        warn!("Interrupted, cancelling outstanding jobs");
        if let Err(e) = on_interrupt.cancel_tasks(&pending) {
            error!("Cancellation failed: {}", e);
        }
    })
    .context("Failed to install Ctrl-C handler")?;

    while !service.wait_idle(Duration::from_millis(500)) {}
    service.stop();

    let mut failed = false;
    for id in &ids {
        let job = service.job(id)?;
        let view = service.status(id)?;
        println!("{}", serde_json::to_string(&serde_json::json!({
            "id": id,
            "status": view.status,
            "percent": view.percent,
            "output": job.output_path,
            "error": job.error,
        }))?);
        failed |= job.status == JobStatus::Error;
    }

    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn run_bundle(args: BundleArgs) -> Result<ExitCode> {
    let db = Database::open(&args.database)
        .with_context(|| format!("Failed to open {}", args.database.display()))?;
    let store = SqliteJobStore::new(db);
    let ids: Vec<JobId> = args.ids.into_iter().map(JobId::from).collect();

    let archive = create_bundle(&store, &ids, &args.out, args.max)?;
    println!("{}", archive.display());
    Ok(ExitCode::SUCCESS)
}
