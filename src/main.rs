use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use uuid::Uuid;

use review_harvest_lib::directory::{DirectoryClient, EmployerSource};
use review_harvest_lib::distributor::{load_partition, partition};
use review_harvest_lib::input_loader::LocalListing;
use review_harvest_lib::job_manager::{http_worker, require_summaries, JobManager, WorkerSummary};
use review_harvest_lib::operator::{spawn_console_channel, spawn_flag_watcher, OperatorSink, WorkerControl};
use review_harvest_lib::resume_manager::CheckpointStore;
use review_harvest_lib::selector::{fetch_all_employers, select_targets, TargetSet};
use review_harvest_lib::{assembler, logger, HarvestConfig, InteractionGate};

/// Collects employer reviews for the score extremes of a directory.
#[derive(Parser)]
#[command(name = "review-harvest", version, about)]
struct Cli {
    /// JSON config file; defaults apply to anything it leaves out.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `output_dir` from the config.
    #[arg(long, global = true)]
    output: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Query the directory (or a listing file) and write targets.csv.
    Select {
        /// CSV/XLSX listing to use instead of the directory API.
        #[arg(long)]
        listing: Option<PathBuf>,
    },
    /// Split targets.csv into one partition file per worker.
    Partition {
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Collect one worker's partition (one machine's share).
    Collect {
        #[arg(long)]
        worker: usize,
        /// Do not read operator commands from stdin.
        #[arg(long)]
        no_console: bool,
    },
    /// Run every partition locally, one thread per worker.
    Run {
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        no_console: bool,
    },
    /// Merge worker outputs into pros/cons corpora.
    Assemble,
    /// Print every worker's checkpoints.
    Status,
}

fn main() -> Result<(), Box<dyn Error>> {
    logger::init();
    let cli = Cli::parse();

    let mut config = HarvestConfig::load_or_default(cli.config.as_deref())?;
    if let Some(output) = cli.output {
        config.output_dir = output;
    }

    let result = match cli.command {
        Command::Select { listing } => select(&config, listing.as_deref()),
        Command::Partition { workers } => write_partitions(&config, workers),
        Command::Collect { worker, no_console } => collect(&config, worker, !no_console),
        Command::Run { workers, no_console } => run_local(&config, workers, !no_console),
        Command::Assemble => assemble(&config),
        Command::Status => status(&config),
    };

    if let Err(e) = &result {
        error!("{}", e);
    }
    result
}

fn select(config: &HarvestConfig, listing: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let source: Box<dyn EmployerSource> = match listing {
        Some(path) => Box::new(LocalListing::new(path)),
        None => Box::new(DirectoryClient::new(
            config.directory.clone(),
            config.retry,
            config.request_timeout_secs,
        )?),
    };
    info!("Selecting targets from {}", source.name());

    let employers = fetch_all_employers(source.as_ref(), config.directory.max_pages)?;
    let target_set = select_targets(&employers, &config.thresholds);
    target_set.save(config.targets_path())?;
    println!(
        "{} targets ({} positive, {} negative) written to {}",
        target_set.len(),
        target_set
            .targets
            .iter()
            .filter(|t| t.signal == review_harvest_lib::Signal::Positive)
            .count(),
        target_set
            .targets
            .iter()
            .filter(|t| t.signal == review_harvest_lib::Signal::Negative)
            .count(),
        config.targets_path().display()
    );
    Ok(())
}

fn load_target_set(config: &HarvestConfig) -> Result<TargetSet, Box<dyn Error>> {
    let path = config.targets_path();
    if !path.exists() {
        return Err(format!("{} not found; run `select` first", path.display()).into());
    }
    Ok(TargetSet::load(path)?)
}

fn write_partitions(config: &HarvestConfig, workers: Option<usize>) -> Result<(), Box<dyn Error>> {
    let target_set = load_target_set(config)?;
    let assignment = partition(&target_set, workers.unwrap_or(config.worker_count))?;
    assignment.verify(&target_set)?;
    assignment.write_partitions(&config.partition_dir())?;
    for (worker, part) in assignment.partitions.iter().enumerate() {
        println!("worker {}: {} employers", worker, part.len());
    }
    Ok(())
}

fn collect(config: &HarvestConfig, worker: usize, console: bool) -> Result<(), Box<dyn Error>> {
    let targets = load_partition(&config.partition_dir(), worker)?;
    let gate = Arc::new(InteractionGate::new());
    let stop = Arc::new(AtomicBool::new(false));
    let shutdown = Arc::new(AtomicBool::new(false));

    let sink: Arc<dyn OperatorSink> = Arc::new(WorkerControl {
        gate: gate.clone(),
        stop: stop.clone(),
    });
    let flag_dir = config.resume_flag_dir().join(format!("worker-{}", worker));
    let watcher = spawn_flag_watcher(flag_dir, sink.clone(), shutdown.clone())?;
    if console {
        spawn_console_channel(sink)?;
    }

    let worker_runner = http_worker(config, worker, gate, stop)?;
    let summary = worker_runner.run(&targets);
    shutdown.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    print_summary(&summary?);
    Ok(())
}

fn run_local(config: &HarvestConfig, workers: Option<usize>, console: bool) -> Result<(), Box<dyn Error>> {
    let target_set = load_target_set(config)?;
    let assignment = partition(&target_set, workers.unwrap_or(config.worker_count))?;
    assignment.verify(&target_set)?;
    assignment.write_partitions(&config.partition_dir())?;

    let manager = Arc::new(JobManager::start(Uuid::new_v4().to_string(), config, &assignment)?);
    let shutdown = Arc::new(AtomicBool::new(false));
    let sink: Arc<dyn OperatorSink> = manager.clone();
    let watcher = spawn_flag_watcher(config.resume_flag_dir(), sink.clone(), shutdown.clone())?;
    if console {
        spawn_console_channel(sink)?;
    }

    let results = manager.wait();
    shutdown.store(true, Ordering::SeqCst);
    let _ = watcher.join();

    let summaries = require_summaries(results);
    match &summaries {
        Ok(all) => all.iter().for_each(print_summary),
        Err(e) => warn!("{}", e),
    }
    summaries?;
    Ok(())
}

fn print_summary(summary: &WorkerSummary) {
    println!(
        "worker {}: {} exhausted, {} already done, {} failed, {} reviews{}",
        summary.worker,
        summary.exhausted.len(),
        summary.skipped.len(),
        summary.failed.len(),
        summary.reviews,
        if summary.aborted { ", stopped early" } else { "" }
    );
    for (id, reason) in &summary.failed {
        println!("  failed {}: {}", id, reason);
    }
}

fn worker_dirs(config: &HarvestConfig) -> Result<Vec<PathBuf>, Box<dyn Error>> {
    let mut dirs = Vec::new();
    if !config.output_dir.is_dir() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(&config.output_dir)? {
        let path = entry?.path();
        let is_worker = path
            .file_name()
            .and_then(|n| n.to_str())
            .map_or(false, |n| n.starts_with("worker-"));
        if is_worker && path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn assemble(config: &HarvestConfig) -> Result<(), Box<dyn Error>> {
    let target_set = load_target_set(config)?;
    let summary = assembler::assemble(&target_set, &worker_dirs(config)?, &config.corpus_dir())?;
    println!(
        "{} pros documents -> {}\n{} cons documents -> {}",
        summary.pros_documents,
        summary.pros_path.display(),
        summary.cons_documents,
        summary.cons_path.display()
    );
    Ok(())
}

fn status(config: &HarvestConfig) -> Result<(), Box<dyn Error>> {
    for dir in worker_dirs(config)? {
        let store = CheckpointStore::new(&dir)?;
        println!("{}", dir.display());
        for cp in store.list_checkpoints()? {
            println!(
                "  {:<24} {:<9} page {:>4} reviews {:>6}{}",
                cp.employer_id,
                cp.state.to_string(),
                cp.cursor,
                cp.reviews_collected,
                cp.last_error.map(|e| format!("  ({})", e)).unwrap_or_default()
            );
        }
    }
    Ok(())
}
