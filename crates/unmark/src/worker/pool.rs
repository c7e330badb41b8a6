use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, info_span, warn};

use super::finalize::remove_quietly;
use super::queue::{Dequeued, QueuedJob, TaskGuard, TaskQueue};
use super::JobServices;
use crate::error::WorkerError;
use crate::job::{JobId, JobUpdate};
use crate::transform::{TransformContext, TransformError, VideoTransform};

const DEQUEUE_POLL: Duration = Duration::from_millis(100);

/// Fixed set of long-lived worker threads draining the [`TaskQueue`].
///
/// Each worker runs one job at a time. A stop signal lets in-flight jobs
/// reach a terminal state; no new job is dequeued afterwards.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

struct PoolShared {
    services: JobServices,
    queue: Arc<TaskQueue>,
    transform: Arc<dyn VideoTransform>,
    work_root: PathBuf,
    shutdown: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        services: JobServices,
        queue: Arc<TaskQueue>,
        transform: Arc<dyn VideoTransform>,
        worker_count: usize,
        work_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                services,
                queue,
                transform,
                work_root: work_root.into(),
                shutdown: AtomicBool::new(false),
            }),
            worker_count: worker_count.max(1),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Spawns the workers. Calling it again is a no-op.
    pub fn start(&self) -> Result<(), WorkerError> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(WorkerError::NotRunning);
        }
        let tmp_root = self.shared.work_root.join("tmp");
        std::fs::create_dir_all(&tmp_root).map_err(|e| WorkerError::WorkDir {
            path: tmp_root.clone(),
            source: e,
        })?;

        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut workers = self
            .workers
            .lock()
            .map_err(|_| WorkerError::SpawnFailed("worker list lock poisoned".to_string()))?;

        for worker_id in 0..self.worker_count {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("unmark-worker-{}", worker_id))
                .spawn(move || run_worker(worker_id, shared))
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} workers", self.worker_count);
        Ok(())
    }

    /// Signals the workers and waits for them to exit. Calling it again is a no-op.
    pub fn stop(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down worker pool...");
        self.shared.queue.close();

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for (i, worker) in handles.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
        self.shared.fail_unstarted();
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.shared.shutdown.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.shared.queue
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(worker_id: usize, shared: Arc<PoolShared>) {
    debug!("Worker {} started", worker_id);

    loop {
        if shared.shutdown.load(Ordering::Acquire) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        match shared.queue.dequeue_timeout(DEQUEUE_POLL) {
            Dequeued::Job(job) => {
                let _slot = TaskGuard::new(&shared.queue);
                let span = info_span!("job", job_id = %job.id, worker_id);
                let _entered = span.enter();
                shared.process(job);
            }
            Dequeued::Empty => continue,
            Dequeued::Closed => {
                debug!("Worker {} queue closed", worker_id);
                break;
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}

impl PoolShared {
    fn process(&self, job: QueuedJob) {
        let services = &self.services;
        let id = job.id;

        if services.registry.is_cancelled(&id) {
            debug!("Cancelled before dispatch");
            let _ = services.finalizer.cancel(&id, job.cleanup, None);
            return;
        }

        match services.store.update(&id, &JobUpdate::started(Utc::now())) {
            Ok(claimed) => services.broadcaster.publish(&claimed, "Started"),
            Err(e) if e.is_rejection() => {
                debug!("Skipping job: {}", e);
                services.registry.clear(&id);
                return;
            }
            Err(e) => {
                error!("Failed to claim job: {}", e);
                let _ = services
                    .finalizer
                    .fail(&id, &format!("Failed to claim job: {}", e));
                return;
            }
        }

        // A cancel may have landed between dequeue and claim.
        if services.registry.is_cancelled(&id) {
            let _ = services.finalizer.cancel(&id, job.cleanup, None);
            return;
        }

        let output = self.output_path(&id, &job.input_path);
        let work_dir = match tempfile::Builder::new()
            .prefix(&format!("task_{}_", id))
            .tempdir_in(self.work_root.join("tmp"))
        {
            Ok(dir) => dir,
            Err(e) => {
                let _ = services
                    .finalizer
                    .fail(&id, &format!("Failed to create working directory: {}", e));
                return;
            }
        };

        let reporter = services.relay.reporter(id.clone());
        let registry = Arc::clone(&services.registry);
        let cancel_id = id.clone();
        let ctx = TransformContext::new(
            move |percent| reporter.report(percent),
            move || registry.is_cancelled(&cancel_id),
            work_dir.path(),
        );

        info!(input = %job.input_path.display(), "Processing");
        let result = run_guarded(self.transform.as_ref(), &job.input_path, &output, &ctx);
        // Progress for this job must be applied before its terminal write.
        services.relay.flush();

        let _ = match result {
            Ok(()) => services.finalizer.finish(&id, &output),
            Err(TransformError::Cancelled) => {
                services.finalizer.cancel(&id, job.cleanup, Some(&output))
            }
            Err(e) => {
                remove_quietly(&output);
                services.finalizer.fail(&id, &e.to_string())
            }
        };

        if let Err(e) = work_dir.close() {
            warn!("Failed to remove working directory: {}", e);
        }
    }

    /// Jobs still waiting when the pool stops would otherwise sit in
    /// `PROCESSING` with no worker left to claim them.
    fn fail_unstarted(&self) {
        let abandoned = self.queue.drain();
        if abandoned.is_empty() {
            return;
        }
        warn!(count = abandoned.len(), "Failing jobs left in the queue at shutdown");
        for job in abandoned {
            match self
                .services
                .finalizer
                .fail(&job.id, "Service stopped before the job started")
            {
                Ok(_) => {}
                Err(e) if e.is_rejection() => debug!(job_id = %job.id, "Already finalized: {}", e),
                Err(e) => error!(job_id = %job.id, "Failed to finalize queued job at shutdown: {}", e),
            }
        }
    }

    fn output_path(&self, id: &JobId, input: &Path) -> PathBuf {
        let suffix = input
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        self.work_root.join(format!(
            "{}_{}{}",
            id,
            Utc::now().format("%Y%m%d%H%M%S"),
            suffix
        ))
    }
}

/// Runs a transform, turning a panic into [`TransformError::Panicked`].
pub(crate) fn run_guarded(
    transform: &dyn VideoTransform,
    input: &Path,
    output: &Path,
    ctx: &TransformContext,
) -> Result<(), TransformError> {
    panic::catch_unwind(AssertUnwindSafe(|| transform.run(input, output, ctx)))
        .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(payload))))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
