//! Worker runner and the local multi-worker job manager.
//!
//! A `Worker` walks its partition employer by employer. The `JobManager`
//! runs one worker per thread, each with its own gate, stop flag and output
//! directory; the only shared state is the status map the operator reads.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use chrono::Local;
use log::{error, info, warn};
use serde::Serialize;

use crate::collector::{CollectorSettings, EmployerOutcome, ReviewCollector};
use crate::config::HarvestConfig;
use crate::delay_manager::{self, DelayRange};
use crate::distributor::PartitionAssignment;
use crate::error::{HarvestError, Result};
use crate::extractor::Extractor;
use crate::gate::InteractionGate;
use crate::resume_manager::CheckpointStore;
use crate::scraper::{HttpReviewFetcher, ReviewFetcher};
use crate::types::Target;

const LOG_TAIL: usize = 50;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WorkerSummary {
    pub worker: usize,
    pub exhausted: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub aborted: bool,
    pub reviews: u64,
}

impl WorkerSummary {
    pub fn is_complete(&self) -> bool {
        !self.aborted && self.failed.is_empty()
    }
}

/// Progress notifications emitted by `Worker::run`.
pub enum WorkerEvent<'a> {
    Started { index: usize, total: usize, target: &'a Target },
    Finished { target: &'a Target, outcome: &'a EmployerOutcome },
}

pub struct Worker<F: ReviewFetcher> {
    index: usize,
    collector: ReviewCollector<F>,
    employer_delay: DelayRange,
}

impl<F: ReviewFetcher> Worker<F> {
    pub fn new(index: usize, collector: ReviewCollector<F>, employer_delay: DelayRange) -> Self {
        Worker {
            index,
            collector,
            employer_delay,
        }
    }

    pub fn gate(&self) -> &Arc<InteractionGate> {
        self.collector.gate()
    }

    pub fn run(&self, targets: &[Target]) -> Result<WorkerSummary> {
        self.run_with(targets, |_| {})
    }

    /// Collects every target in order. One employer failing, its checkpoint
    /// store included, never stops the rest.
    pub fn run_with<E>(&self, targets: &[Target], mut on_event: E) -> Result<WorkerSummary>
    where
        E: FnMut(WorkerEvent<'_>),
    {
        let mut summary = WorkerSummary {
            worker: self.index,
            ..WorkerSummary::default()
        };
        let total = targets.len();
        let mut fetched_any = false;

        for (i, target) in targets.iter().enumerate() {
            if self.collector.stop_requested() {
                summary.aborted = true;
                break;
            }
            info!(
                "Worker {}: {} / {} : {} ({}, {})",
                self.index,
                i + 1,
                total,
                target.name,
                target.id,
                target.signal
            );
            on_event(WorkerEvent::Started { index: i, total, target });

            if fetched_any {
                delay_manager::random_employer_delay(self.employer_delay);
            }

            let outcome = match self.collector.collect_employer(&target.id) {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!("Worker {}: '{}' hit a store error: {}", self.index, target.id, e);
                    EmployerOutcome::Failed {
                        reason: format!("store error: {}", e),
                    }
                }
            };
            match &outcome {
                EmployerOutcome::Exhausted { reviews, .. } => {
                    fetched_any = true;
                    summary.reviews += reviews;
                    summary.exhausted.push(target.id.clone());
                }
                EmployerOutcome::Skipped { reviews } => {
                    summary.reviews += reviews;
                    summary.skipped.push(target.id.clone());
                }
                EmployerOutcome::Failed { reason } => {
                    fetched_any = true;
                    summary.failed.push((target.id.clone(), reason.clone()));
                }
                EmployerOutcome::Aborted => summary.aborted = true,
            }
            on_event(WorkerEvent::Finished { target, outcome: &outcome });
            if summary.aborted {
                break;
            }
        }

        info!(
            "Worker {} done: {} exhausted, {} skipped, {} failed, {} reviews{}",
            self.index,
            summary.exhausted.len(),
            summary.skipped.len(),
            summary.failed.len(),
            summary.reviews,
            if summary.aborted { " (stopped)" } else { "" }
        );
        for (id, reason) in &summary.failed {
            warn!("Worker {}: '{}' failed: {}", self.index, id, reason);
        }
        Ok(summary)
    }
}

/// Builds a production worker writing under `config.worker_dir(index)`.
pub fn http_worker(
    config: &HarvestConfig,
    index: usize,
    gate: Arc<InteractionGate>,
    stop: Arc<AtomicBool>,
) -> Result<Worker<HttpReviewFetcher>> {
    let fetcher = HttpReviewFetcher::new(&config.review_url_template, config.request_timeout_secs)?;
    build_worker(config, index, fetcher, gate, stop)
}

pub fn build_worker<F: ReviewFetcher>(
    config: &HarvestConfig,
    index: usize,
    fetcher: F,
    gate: Arc<InteractionGate>,
    stop: Arc<AtomicBool>,
) -> Result<Worker<F>> {
    let collector = ReviewCollector::new(
        fetcher,
        Extractor::new(&config.layout)?,
        CheckpointStore::new(config.worker_dir(index))?,
        gate,
        stop,
        CollectorSettings::from(config),
    );
    Ok(Worker::new(index, collector, config.employer_delay_secs))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Queued,
    Processing,
    Blocked,
    Stopped,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker: usize,
    pub status: RunState,
    pub total_targets: usize,
    pub processed_count: usize,
    pub current_employer: String,
    /// Employers currently parked at this worker's gate.
    pub blocked: Vec<String>,
    pub logs: Vec<String>,
    pub summary: Option<WorkerSummary>,
}

impl WorkerStatus {
    fn log(&mut self, msg: String) {
        let stamped = format!("{} {}", Local::now().format("%H:%M:%S"), msg);
        self.logs.push(stamped);
        if self.logs.len() > LOG_TAIL {
            self.logs.remove(0);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Stop,
}

struct WorkerHandle {
    gate: Arc<InteractionGate>,
    stop: Arc<AtomicBool>,
}

type StatusMap = Arc<Mutex<HashMap<usize, WorkerStatus>>>;

fn lock_status(jobs: &StatusMap) -> MutexGuard<'_, HashMap<usize, WorkerStatus>> {
    jobs.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs every partition of an assignment on its own thread.
pub struct JobManager {
    pub run_id: String,
    jobs: StatusMap,
    handles: HashMap<usize, WorkerHandle>,
    threads: Mutex<Vec<JoinHandle<Option<WorkerSummary>>>>,
}

impl JobManager {
    /// Spawns one HTTP-backed worker per partition.
    pub fn start(run_id: String, config: &HarvestConfig, assignment: &PartitionAssignment) -> Result<Self> {
        let config = config.clone();
        Self::start_with(run_id, assignment, move |index, gate, stop| {
            http_worker(&config, index, gate, stop)
        })
    }

    /// Spawns workers built by `make_worker`; used with scripted fetchers in tests.
    pub fn start_with<F, M>(run_id: String, assignment: &PartitionAssignment, make_worker: M) -> Result<Self>
    where
        F: ReviewFetcher + 'static,
        M: Fn(usize, Arc<InteractionGate>, Arc<AtomicBool>) -> Result<Worker<F>> + Send + Sync + 'static,
    {
        let jobs: StatusMap = Arc::new(Mutex::new(HashMap::new()));
        let make_worker = Arc::new(make_worker);
        let mut handles = HashMap::new();
        let mut threads = Vec::new();

        for (index, targets) in assignment.partitions.iter().enumerate() {
            let gate = Arc::new(InteractionGate::new());
            let stop = Arc::new(AtomicBool::new(false));
            lock_status(&jobs).insert(
                index,
                WorkerStatus {
                    worker: index,
                    status: RunState::Queued,
                    total_targets: targets.len(),
                    processed_count: 0,
                    current_employer: "Initializing...".to_string(),
                    blocked: Vec::new(),
                    logs: vec![format!("Worker {} queued with {} targets.", index, targets.len())],
                    summary: None,
                },
            );
            handles.insert(
                index,
                WorkerHandle {
                    gate: gate.clone(),
                    stop: stop.clone(),
                },
            );

            let jobs_arc = jobs.clone();
            let make_worker = make_worker.clone();
            let targets = targets.clone();
            let thread = thread::Builder::new()
                .name(format!("worker-{}", index))
                .spawn(move || {
                    Self::run_worker(index, jobs_arc, targets, || make_worker(index, gate, stop))
                })?;
            threads.push(thread);
        }

        info!("Run {} started with {} workers", run_id, threads.len());
        Ok(JobManager {
            run_id,
            jobs,
            handles,
            threads: Mutex::new(threads),
        })
    }

    fn run_worker<F, B>(index: usize, jobs: StatusMap, targets: Vec<Target>, build: B) -> Option<WorkerSummary>
    where
        F: ReviewFetcher,
        B: FnOnce() -> Result<Worker<F>>,
    {
        let update = |f: &dyn Fn(&mut WorkerStatus)| {
            if let Some(job) = lock_status(&jobs).get_mut(&index) {
                f(job);
            }
        };

        let worker = match build() {
            Ok(w) => w,
            Err(e) => {
                error!("Worker {} could not start: {}", index, e);
                update(&|job| {
                    job.status = RunState::Failed;
                    job.log(format!("Failed to start: {}", e));
                });
                return None;
            }
        };
        update(&|job| job.status = RunState::Processing);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            worker.run_with(&targets, |event| match event {
                WorkerEvent::Started { index: i, target, .. } => update(&|job| {
                    job.processed_count = i;
                    job.current_employer = target.id.clone();
                    job.log(format!("Collecting {} ({})", target.name, target.id));
                }),
                WorkerEvent::Finished { target, outcome } => update(&|job| {
                    job.processed_count += 1;
                    job.log(format!("{}: {:?}", target.id, outcome));
                }),
            })
        }));

        match result {
            Ok(Ok(summary)) => {
                let done = summary.clone();
                update(&|job| {
                    job.status = if done.aborted {
                        RunState::Stopped
                    } else {
                        RunState::Completed
                    };
                    job.current_employer = "Done".to_string();
                    job.log(format!(
                        "{} exhausted, {} failed, {} reviews",
                        done.exhausted.len() + done.skipped.len(),
                        done.failed.len(),
                        done.reviews
                    ));
                    job.summary = Some(done.clone());
                });
                Some(summary)
            }
            Ok(Err(e)) => {
                error!("Worker {} halted: {}", index, e);
                update(&|job| {
                    job.status = RunState::Failed;
                    job.log(format!("Halted: {}", e));
                });
                None
            }
            Err(_) => {
                error!("Worker {} panicked", index);
                update(&|job| {
                    job.status = RunState::Failed;
                    job.log("Worker panicked.".to_string());
                });
                None
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Forwards an operator resume to whichever worker is blocked on the employer.
    pub fn signal_resume(&self, worker: usize, employer_id: &str) -> bool {
        self.handles
            .get(&worker)
            .map(|h| h.gate.signal_resume(employer_id))
            .unwrap_or(false)
    }

    pub fn send_control(&self, worker: usize, control: Control) -> bool {
        let Some(handle) = self.handles.get(&worker) else {
            return false;
        };
        match control {
            Control::Stop => {
                handle.stop.store(true, Ordering::SeqCst);
                handle.gate.abort();
                if let Some(job) = lock_status(&self.jobs).get_mut(&worker) {
                    job.log("Stop requested by operator.".to_string());
                }
            }
        }
        true
    }

    pub fn stop_all(&self) {
        for worker in self.handles.keys() {
            self.send_control(*worker, Control::Stop);
        }
    }

    pub fn status(&self, worker: usize) -> Option<WorkerStatus> {
        let mut status = lock_status(&self.jobs).get(&worker).cloned()?;
        status.blocked = self.handles.get(&worker).map(|h| h.gate.blocked()).unwrap_or_default();
        if status.status == RunState::Processing && !status.blocked.is_empty() {
            status.status = RunState::Blocked;
        }
        Some(status)
    }

    pub fn statuses(&self) -> Vec<WorkerStatus> {
        let mut workers: Vec<usize> = self.handles.keys().copied().collect();
        workers.sort_unstable();
        workers.into_iter().filter_map(|w| self.status(w)).collect()
    }

    /// Blocked employers per worker.
    pub fn blocked(&self) -> Vec<(usize, Vec<String>)> {
        let mut out: Vec<(usize, Vec<String>)> = self
            .handles
            .iter()
            .map(|(w, h)| (*w, h.gate.blocked()))
            .filter(|(_, ids)| !ids.is_empty())
            .collect();
        out.sort_by_key(|(w, _)| *w);
        out
    }

    /// Routes a resume to whichever worker currently has the employer blocked.
    pub fn resume_anywhere(&self, employer_id: &str) -> bool {
        self.handles
            .values()
            .any(|h| h.gate.signal_resume(employer_id))
    }

    pub fn is_finished(&self) -> bool {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .all(|t| t.is_finished())
    }

    /// Joins every worker. Missing summaries mean the worker failed or panicked.
    pub fn wait(&self) -> Vec<Option<WorkerSummary>> {
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        threads
            .into_iter()
            .map(|t| t.join().ok().flatten())
            .collect()
    }
}

/// Surfaces workers that did not produce a summary.
pub fn require_summaries(results: Vec<Option<WorkerSummary>>) -> Result<Vec<WorkerSummary>> {
    let mut summaries = Vec::new();
    let mut missing = Vec::new();
    for (worker, result) in results.into_iter().enumerate() {
        match result {
            Some(s) => summaries.push(s),
            None => missing.push(format!("worker-{}", worker)),
        }
    }
    if !missing.is_empty() {
        return Err(HarvestError::IncompleteCollection { unfinished: missing });
    }
    Ok(summaries)
}
