//! Bounded fan-out over a group of jobs.
//!
//! The coordinator admits every job up front, then keeps at most `M`
//! transforms running at a time on tokio's blocking pool. Whenever one
//! finishes the next pending job (lowest priority value, then submission
//! order) is started immediately.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};

use super::report::{
    BatchProgress, BatchProgressReporter, BatchResult, BatchStats, BatchTask, FailedTask,
    NoopBatchProgress,
};
use crate::config::BatchConfig;
use crate::error::{UnmarkError, ValidationError, WorkerError};
use crate::job::{JobId, JobSnapshot, JobStatus, JobUpdate, NewJob};
use crate::transform::{TransformContext, TransformError, VideoTransform};
use crate::worker::finalize::remove_quietly;
use crate::worker::pool::run_guarded;
use crate::worker::{FileCleanup, JobServices};

/// One file to process as part of a batch.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    /// Lower is served first.
    pub priority: i32,
}

impl BatchJob {
    pub fn new(input_path: impl Into<PathBuf>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            output_path: output_path.into(),
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone)]
struct PlannedJob {
    job: JobSnapshot,
    input_path: PathBuf,
    output_path: PathBuf,
    submitted_at: DateTime<Utc>,
}

/// Admitted jobs in dispatch order, ready to [`run`](BatchCoordinator::run).
#[derive(Debug, Clone)]
pub struct BatchPlan {
    batch_id: String,
    concurrency_limit: usize,
    entries: Vec<PlannedJob>,
}

impl BatchPlan {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Job ids in the order they will be dispatched.
    pub fn job_ids(&self) -> Vec<JobId> {
        self.entries.iter().map(|e| e.job.id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskOutcome {
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone)]
enum Verdict {
    Finished,
    Cancelled,
    Failed(String),
}

/// Counts transforms currently executing and remembers the peak.
#[derive(Default)]
struct ConcurrencyGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    fn enter(self: &Arc<Self>) -> GaugeSlot {
        let now = self.active.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        GaugeSlot(Arc::clone(self))
    }

    fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}

struct GaugeSlot(Arc<ConcurrencyGauge>);

impl Drop for GaugeSlot {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Runs one-shot batches over an ad hoc execution surface, independent of
/// the persistent worker pool.
#[derive(Clone)]
pub struct BatchCoordinator {
    services: JobServices,
    transform: Arc<dyn VideoTransform>,
    temp_root: PathBuf,
    job_timeout: Option<Duration>,
    reporter: Arc<dyn BatchProgressReporter>,
}

impl BatchCoordinator {
    pub fn new(
        services: JobServices,
        transform: Arc<dyn VideoTransform>,
        config: &BatchConfig,
    ) -> Self {
        Self {
            services,
            transform,
            temp_root: config.temp_directory.clone(),
            job_timeout: config.job_timeout(),
            reporter: Arc::new(NoopBatchProgress),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn BatchProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Validates and admits every job, then runs the batch to completion.
    pub async fn submit_batch(
        &self,
        jobs: Vec<BatchJob>,
        concurrency_limit: usize,
    ) -> Result<BatchResult, UnmarkError> {
        let plan = self.admit(jobs, concurrency_limit)?;
        Ok(self.run(plan).await)
    }

    /// Validates the jobs and creates their records in `PROCESSING`.
    ///
    /// Nothing is created if any job fails validation.
    pub fn admit(
        &self,
        jobs: Vec<BatchJob>,
        concurrency_limit: usize,
    ) -> Result<BatchPlan, UnmarkError> {
        if concurrency_limit == 0 {
            return Err(ValidationError::ZeroConcurrency.into());
        }
        if jobs.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }
        for job in &jobs {
            validate_job(job)?;
        }

        let temp_root = &self.temp_root;
        std::fs::create_dir_all(temp_root).map_err(|e| WorkerError::WorkDir {
            path: temp_root.clone(),
            source: e,
        })?;

        let services = &self.services;
        let mut entries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let created = services.store.create(NewJob::with_priority(job.priority))?;
            let queued = services
                .store
                .update(&created.id, &JobUpdate::queued(&job.input_path))?;
            services.broadcaster.publish(&queued, "Queued");
            entries.push(PlannedJob {
                job: queued,
                input_path: job.input_path,
                output_path: job.output_path,
                submitted_at: Utc::now(),
            });
        }
        // Stable sort: equal priorities keep submission order.
        entries.sort_by_key(|e| e.job.priority);

        let batch_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(batch_id = %batch_id, total = entries.len(), concurrency_limit, "Batch admitted");

        Ok(BatchPlan {
            batch_id,
            concurrency_limit,
            entries,
        })
    }

    /// Runs an admitted batch with a sliding window of `concurrency_limit` jobs.
    pub async fn run(&self, plan: BatchPlan) -> BatchResult {
        let span = info_span!("batch", batch_id = %plan.batch_id);
        Arc::new(self.clone()).run_plan(plan).instrument(span).await
    }

    async fn run_plan(self: Arc<Self>, plan: BatchPlan) -> BatchResult {
        let BatchPlan {
            batch_id,
            concurrency_limit,
            entries,
        } = plan;
        let total = entries.len();
        let clock = Instant::now();
        let gauge = Arc::new(ConcurrencyGauge::default());

        let mut pending = entries.into_iter();
        let mut running: JoinSet<(TaskOutcome, BatchTask)> = JoinSet::new();

        let mut finished: Vec<BatchTask> = Vec::with_capacity(total);
        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut cancelled = Vec::new();

        loop {
            while running.len() < concurrency_limit {
                let Some(entry) = pending.next() else { break };
                let span = info_span!("job", job_id = %entry.job.id, priority = entry.job.priority);
                let this = Arc::clone(&self);
                let gauge = Arc::clone(&gauge);
                running.spawn(async move {
                    let job = entry.job.clone();
                    let submitted_at = entry.submitted_at;
                    let output = entry.output_path.clone();
                    // Nested so a panic inside `execute` is still attributed to its job.
                    let attempt =
                        tokio::spawn(Arc::clone(&this).execute(entry, gauge).instrument(span));
                    match attempt.await {
                        Ok(done) => done,
                        Err(e) => {
                            error!(job_id = %job.id, "Batch task aborted: {}", e);
                            let message = format!("Batch task aborted: {}", e);
                            let task = new_task(job, submitted_at);
                            this.finalize(task, Verdict::Failed(message), output).await
                        }
                    }
                });
            }

            let Some(joined) = running.join_next().await else {
                break;
            };

            let (outcome, task) = match joined {
                Ok(done) => done,
                Err(e) => {
                    // Only reachable if finalizing itself panicked.
                    error!("Batch task lost: {}", e);
                    continue;
                }
            };

            finished.push(task.clone());
            match outcome {
                TaskOutcome::Completed => completed.push(task),
                TaskOutcome::Cancelled => cancelled.push(task),
                TaskOutcome::Failed => failed.push(FailedTask {
                    error: task.error.clone().unwrap_or_default(),
                    job: task.job,
                }),
            }

            let progress = BatchProgress::estimate(
                &batch_id,
                &finished,
                (completed.len(), failed.len(), cancelled.len()),
                total,
                concurrency_limit,
                gauge.active(),
            );
            info!(
                "Progress: {:.1}% ({}/{}) - ETA: {:.0}s - Active: {}",
                progress.progress_percent,
                finished.len(),
                total,
                progress.eta_seconds,
                progress.concurrent_active
            );
            self.reporter.report(&progress);
        }

        let stats = BatchStats::compute(
            total,
            &completed,
            failed.len(),
            cancelled.len(),
            clock.elapsed(),
            gauge.peak(),
        );
        info!(
            completed = stats.completed,
            failed = stats.failed,
            cancelled = stats.cancelled,
            elapsed_seconds = stats.elapsed_seconds,
            throughput_per_minute = stats.throughput_per_minute,
            "Batch finished"
        );

        BatchResult {
            batch_id,
            success: failed.is_empty(),
            completed,
            failed,
            cancelled,
            stats,
        }
    }

    async fn execute(
        self: Arc<Self>,
        entry: PlannedJob,
        gauge: Arc<ConcurrencyGauge>,
    ) -> (TaskOutcome, BatchTask) {
        let PlannedJob {
            job,
            input_path,
            output_path,
            submitted_at,
        } = entry;
        let id = job.id.clone();
        let services = &self.services;
        let mut task = new_task(job, submitted_at);

        if services.registry.is_cancelled(&id) {
            return self.finalize(task, Verdict::Cancelled, output_path).await;
        }

        match services.store.update(&id, &JobUpdate::started(Utc::now())) {
            Ok(claimed) => {
                services.broadcaster.publish(&claimed, "Started");
                task.started_at = claimed.started_at;
                task.job = claimed;
            }
            Err(e) if e.is_rejection() => {
                // Finalized elsewhere, typically cancelled before dispatch.
                services.registry.clear(&id);
                return self.settle_rejected(task, e.to_string());
            }
            Err(e) => {
                let message = format!("Failed to claim job: {}", e);
                return self.finalize(task, Verdict::Failed(message), output_path).await;
            }
        }

        let work_dir = match tempfile::Builder::new()
            .prefix(&format!("task_{}_", id))
            .tempdir_in(&self.temp_root)
        {
            Ok(dir) => dir,
            Err(e) => {
                let message = format!("Failed to create working directory: {}", e);
                return self.finalize(task, Verdict::Failed(message), output_path).await;
            }
        };

        let abandoned = Arc::new(AtomicBool::new(false));
        let ctx = {
            let reporter = services.relay.reporter(id.clone());
            let registry = Arc::clone(&services.registry);
            let abandoned = Arc::clone(&abandoned);
            let id = id.clone();
            TransformContext::new(
                move |percent| reporter.report(percent),
                move || registry.is_cancelled(&id) || abandoned.load(Ordering::Acquire),
                work_dir.path(),
            )
        };

        let transform = Arc::clone(&self.transform);
        let relay = Arc::clone(&services.relay);
        let (input, output) = (input_path.clone(), output_path.clone());
        let slot = gauge.enter();
        let clock = Instant::now();

        // The closure owns the work dir, so it is removed when the transform
        // returns even if this task has already moved on after a timeout.
        let orphaned = Arc::clone(&abandoned);
        let handle = tokio::task::spawn_blocking(move || {
            let _slot = slot;
            let result = run_guarded(transform.as_ref(), &input, &output, &ctx);
            relay.flush();
            // The job was already finalized as timed out; drop whatever the
            // transform wrote after that.
            if orphaned.load(Ordering::Acquire) {
                remove_quietly(&output);
            }
            if let Err(e) = work_dir.close() {
                warn!("Failed to remove working directory: {}", e);
            }
            result
        });

        let result = match self.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => flatten(joined),
                Err(_) => {
                    abandoned.store(true, Ordering::Release);
                    warn!(timeout_secs = limit.as_secs_f64(), "Job timed out, abandoning");
                    Err(TransformError::TimedOut { limit })
                }
            },
            None => flatten(handle.await),
        };
        task.processing_time = Some(clock.elapsed().as_secs_f64());

        let verdict = match result {
            Ok(()) => Verdict::Finished,
            Err(TransformError::Cancelled) => Verdict::Cancelled,
            Err(e) => Verdict::Failed(e.to_string()),
        };
        self.finalize(task, verdict, output_path).await
    }

    async fn finalize(
        &self,
        mut task: BatchTask,
        verdict: Verdict,
        output: PathBuf,
    ) -> (TaskOutcome, BatchTask) {
        let finalizer = Arc::clone(&self.services.finalizer);
        let id = task.job.id.clone();
        let write = verdict.clone();

        let written = tokio::task::spawn_blocking(move || match write {
            Verdict::Finished => finalizer.finish(&id, &output),
            Verdict::Cancelled => finalizer.cancel(&id, FileCleanup::OutputOnly, Some(&output)),
            Verdict::Failed(message) => {
                remove_quietly(&output);
                finalizer.fail(&id, &message)
            }
        })
        .await;
        task.finished_at = Some(Utc::now());

        match written {
            Ok(Ok(job)) => {
                task.job = job;
                match verdict {
                    Verdict::Finished => (TaskOutcome::Completed, task),
                    Verdict::Cancelled => (TaskOutcome::Cancelled, task),
                    Verdict::Failed(message) => {
                        task.error = Some(message);
                        (TaskOutcome::Failed, task)
                    }
                }
            }
            Ok(Err(e)) if e.is_rejection() => self.settle_rejected(task, e.to_string()),
            Ok(Err(e)) => {
                task.error = Some(format!("Failed to persist result: {}", e));
                (TaskOutcome::Failed, task)
            }
            Err(e) => {
                task.error = Some(format!("Finalize task aborted: {}", e));
                (TaskOutcome::Failed, task)
            }
        }
    }

    /// Reports a job whose terminal state was written by someone else.
    fn settle_rejected(&self, mut task: BatchTask, reason: String) -> (TaskOutcome, BatchTask) {
        if let Ok(Some(current)) = self.services.store.get(&task.job.id) {
            task.job = current;
        }
        if task.finished_at.is_none() {
            task.finished_at = Some(Utc::now());
        }
        match task.job.status {
            JobStatus::Finished => (TaskOutcome::Completed, task),
            JobStatus::Cancelled => (TaskOutcome::Cancelled, task),
            _ => {
                task.error = Some(task.job.error.clone().unwrap_or(reason));
                (TaskOutcome::Failed, task)
            }
        }
    }
}

fn new_task(job: JobSnapshot, submitted_at: DateTime<Utc>) -> BatchTask {
    BatchTask {
        job,
        submitted_at,
        started_at: None,
        finished_at: None,
        processing_time: None,
        error: None,
    }
}

fn flatten(joined: Result<Result<(), TransformError>, JoinError>) -> Result<(), TransformError> {
    joined.unwrap_or_else(|e| Err(TransformError::Panicked(e.to_string())))
}

fn validate_job(job: &BatchJob) -> Result<(), ValidationError> {
    if !job.input_path.is_file() {
        return Err(ValidationError::MissingInput(job.input_path.clone()));
    }

    match mime_guess::from_path(&job.input_path).first() {
        Some(mime) if mime.type_() == mime_guess::mime::VIDEO => {}
        other => {
            return Err(ValidationError::NotAVideo {
                path: job.input_path.clone(),
                detected: other
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
            })
        }
    }

    if job.output_path == job.input_path {
        return Err(ValidationError::OutputIsInput(job.output_path.clone()));
    }

    Ok(())
}
