//! Control-plane facade over the worker pool, store and batch coordinator.
//!
//! Everything a client-facing layer needs lives here: job admission,
//! queueing after upload, cancellation, status queries and bundling.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::batch::BatchCoordinator;
use crate::broadcast::JobProgressEvent;
use crate::bundle::create_bundle;
use crate::config::{BatchConfig, ServiceConfig};
use crate::db::Database;
use crate::error::{ConfigError, Result, ValidationError};
use crate::job::{JobFilter, JobId, JobSnapshot, JobStatus, JobUpdate, NewJob};
use crate::store::{JobStore, MemoryJobStore, SqliteJobStore, StoreError};
use crate::transform::{CommandTransform, VideoTransform};
use crate::worker::finalize::remove_quietly;
use crate::worker::{FileCleanup, JobServices, QueuedJob, TaskQueue, WorkerPool};

/// What a client sees when polling a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub percent: u8,
    pub status: JobStatus,
    pub download_url: Option<String>,
}

impl From<&JobSnapshot> for JobStatusView {
    fn from(job: &JobSnapshot) -> Self {
        Self {
            percent: job.percent,
            status: job.status,
            download_url: job.download_url.clone(),
        }
    }
}

/// Outcome of a [`WatermarkService::cancel_tasks`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelSummary {
    /// Ids in the request.
    pub requested: usize,
    /// Jobs moved straight to `CANCELLED` because no worker held them.
    pub finalized: usize,
    /// Running jobs left flagged for cooperative abort.
    pub flagged: usize,
}

pub struct WatermarkService {
    config: ServiceConfig,
    services: JobServices,
    queue: Arc<TaskQueue>,
    pool: WorkerPool,
    transform: Arc<dyn VideoTransform>,
}

impl WatermarkService {
    /// Builds the service with the configured command transform.
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        let transform = match config.transform {
            Some(ref t) => CommandTransform::from_config(t),
            None => {
                return Err(ConfigError::Validation {
                    message: "a 'transform' section is required to process jobs".to_string(),
                }
                .into())
            }
        };
        Self::open(config, Arc::new(transform))
    }

    /// Opens the configured store (SQLite when `database_path` is set,
    /// memory otherwise) and wires the pool around `transform`.
    pub fn open(config: ServiceConfig, transform: Arc<dyn VideoTransform>) -> Result<Self> {
        let store: Arc<dyn JobStore> = match config.database_path {
            Some(ref path) => {
                let db = Database::open(path).map_err(StoreError::from)?;
                Arc::new(SqliteJobStore::new(db))
            }
            None => Arc::new(MemoryJobStore::new()),
        };
        Self::with_store(config, store, transform)
    }

    pub fn with_store(
        config: ServiceConfig,
        store: Arc<dyn JobStore>,
        transform: Arc<dyn VideoTransform>,
    ) -> Result<Self> {
        let services = JobServices::new(
            store,
            config.finalize_retry.clone(),
            &config.download_url_prefix,
        )?;
        let queue = Arc::new(TaskQueue::new());
        let pool = WorkerPool::new(
            services.clone(),
            Arc::clone(&queue),
            Arc::clone(&transform),
            config.worker_count,
            config.working_directory.clone(),
        );

        Ok(Self {
            config,
            services,
            queue,
            pool,
            transform,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn services(&self) -> &JobServices {
        &self.services
    }

    /// Starts the worker pool. Idempotent.
    pub fn start(&self) -> Result<()> {
        let upload_dir = self.config.upload_dir();
        std::fs::create_dir_all(&upload_dir).map_err(|e| crate::error::WorkerError::WorkDir {
            path: upload_dir.clone(),
            source: e,
        })?;
        self.pool.start()?;
        info!(
            workers = self.pool.worker_count(),
            working_directory = %self.config.working_directory.display(),
            "Watermark service started"
        );
        Ok(())
    }

    /// Stops the pool, letting in-flight jobs finish, then drains the
    /// progress relay. Jobs that were still queued end in `ERROR`. Idempotent.
    pub fn stop(&self) {
        self.pool.stop();
        self.services.relay.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.pool.is_running()
    }

    /// Admits a new job in `UPLOADING`.
    pub fn create_job(&self, priority: i32) -> Result<JobSnapshot> {
        let job = self.services.store.create(NewJob::with_priority(priority))?;
        debug!(job_id = %job.id, priority, "Job created");
        self.services.broadcaster.publish(&job, "Created");
        Ok(job)
    }

    /// Destination for an uploaded file: `<upload_dir>/<uuid>_<file name>`.
    pub fn upload_path(&self, filename: &str) -> PathBuf {
        let name = Path::new(filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        self.config
            .upload_dir()
            .join(format!("{}_{}", uuid::Uuid::new_v4(), name))
    }

    /// Moves an uploaded job to `PROCESSING` and enqueues it.
    ///
    /// A job cancelled while uploading is finalized `CANCELLED` instead and
    /// its uploaded file is deleted.
    pub fn queue_job(&self, id: &JobId, input_path: &Path) -> Result<JobSnapshot> {
        let services = &self.services;

        if !services.registry.is_cancelled(id) {
            match services.store.update(id, &JobUpdate::queued(input_path)) {
                Ok(job) => return self.enqueue(job, input_path),
                Err(StoreError::Rejected { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let current = services
            .store
            .get(id)?
            .ok_or_else(|| ValidationError::UnknownJob(id.clone()))?;
        let job = match current.status {
            JobStatus::Cancelled => current,
            JobStatus::Uploading => services
                .finalizer
                .cancel_unstarted(id, FileCleanup::InputAndOutput)?,
            other => {
                return Err(ValidationError::WrongStatus {
                    id: id.clone(),
                    status: other.to_string(),
                    expected: "UPLOADING",
                }
                .into())
            }
        };
        info!(job_id = %id, "Upload finished after cancellation, discarding");
        remove_quietly(input_path);
        Ok(job)
    }

    fn enqueue(&self, job: JobSnapshot, input_path: &Path) -> Result<JobSnapshot> {
        self.services.broadcaster.publish(&job, "Queued");
        let entry = QueuedJob {
            id: job.id.clone(),
            input_path: input_path.to_path_buf(),
            priority: job.priority,
            cleanup: self.cleanup_for(&job),
        };
        if let Err(e) = self.queue.enqueue(entry) {
            warn!(job_id = %job.id, "Could not enqueue job: {}", e);
            self.services
                .finalizer
                .fail(&job.id, "Service is shutting down")?;
            return Err(e.into());
        }
        info!(job_id = %job.id, priority = job.priority, "Job queued");
        Ok(job)
    }

    /// Upload failure path: `ERROR` with percent 0.
    pub fn mark_error(&self, id: &JobId, message: &str) -> Result<JobSnapshot> {
        Ok(self.services.finalizer.fail(id, message)?)
    }

    /// Requests cancellation of `ids`.
    ///
    /// Jobs no worker holds yet are finalized `CANCELLED` right away; running
    /// jobs stay flagged until their transform observes the flag. Terminal
    /// and unknown ids are ignored, so repeating a request is harmless.
    /// This covers jobs of batches built with [`Self::batch_coordinator`].
    pub fn cancel_tasks(&self, ids: &[JobId]) -> Result<CancelSummary> {
        let services = &self.services;
        let newly_flagged = services.registry.request_cancel(ids);
        let mut summary = CancelSummary {
            requested: ids.len(),
            ..CancelSummary::default()
        };

        for id in ids {
            let Some(job) = services.store.get(id)? else {
                services.registry.clear(id);
                continue;
            };
            if job.is_terminal() {
                services.registry.clear(id);
                continue;
            }

            if job.status == JobStatus::Uploading || job.is_queued() {
                match services
                    .finalizer
                    .cancel_unstarted(id, self.cleanup_for(&job))
                {
                    Ok(_) => {
                        self.queue.remove(id);
                        summary.finalized += 1;
                        continue;
                    }
                    // Claimed by a worker in the meantime; the flag stays set.
                    Err(e) if e.is_rejection() => {}
                    Err(e) => return Err(e.into()),
                }
            }
            summary.flagged += 1;
        }

        info!(
            requested = summary.requested,
            newly_flagged,
            finalized = summary.finalized,
            flagged = summary.flagged,
            "Cancellation requested"
        );
        Ok(summary)
    }

    /// Uploaded inputs belong to the service; batch inputs belong to the caller.
    fn cleanup_for(&self, job: &JobSnapshot) -> FileCleanup {
        let upload_dir = self.config.upload_dir();
        match job.input_path {
            Some(ref input) if input.starts_with(&upload_dir) => FileCleanup::InputAndOutput,
            _ => FileCleanup::OutputOnly,
        }
    }

    pub fn status(&self, id: &JobId) -> Result<JobStatusView> {
        Ok(JobStatusView::from(&self.job(id)?))
    }

    pub fn job(&self, id: &JobId) -> Result<JobSnapshot> {
        self.services
            .store
            .get(id)?
            .ok_or_else(|| ValidationError::UnknownJob(id.clone()).into())
    }

    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<JobSnapshot>> {
        Ok(self.services.store.list(filter)?)
    }

    /// Output file of a `FINISHED` job, if it still exists.
    pub fn output_path(&self, id: &JobId) -> Result<Option<PathBuf>> {
        let job = self.job(id)?;
        if job.status != JobStatus::Finished {
            return Ok(None);
        }
        Ok(job.output_path.filter(|p| p.is_file()))
    }

    /// Claimed jobs whose `started_at` is older than `stale_after_secs`.
    pub fn stale_jobs(&self) -> Result<Vec<JobSnapshot>> {
        let threshold = chrono::Duration::from_std(self.config.stale_after())
            .unwrap_or_else(|_| chrono::Duration::weeks(520));
        let now = Utc::now();
        let jobs = self
            .services
            .store
            .list(&JobFilter::with_status(JobStatus::Processing))?;
        Ok(jobs
            .into_iter()
            .filter(|j| j.is_stale(now, threshold))
            .collect())
    }

    /// Deletes a terminal job's record and its output file.
    pub fn purge_job(&self, id: &JobId) -> Result<bool> {
        let job = self.job(id)?;
        if !job.is_terminal() {
            return Err(ValidationError::WrongStatus {
                id: id.clone(),
                status: job.status.to_string(),
                expected: "a terminal status",
            }
            .into());
        }
        if let Some(ref output) = job.output_path {
            remove_quietly(output);
        }
        Ok(self.services.store.delete(id)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobProgressEvent> {
        self.services.broadcaster.subscribe()
    }

    /// Zips the outputs of finished jobs into `dest_dir`.
    pub fn bundle(&self, ids: &[JobId], dest_dir: &Path) -> Result<PathBuf> {
        Ok(create_bundle(
            self.services.store.as_ref(),
            ids,
            dest_dir,
            self.config.batch.max_bundle_size,
        )?)
    }

    /// A coordinator sharing this service's store, cancel flags and relay.
    pub fn batch_coordinator(&self, config: &BatchConfig) -> BatchCoordinator {
        BatchCoordinator::new(self.services.clone(), Arc::clone(&self.transform), config)
    }

    /// Blocks until every enqueued job has been handled or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let idle = self.queue.join_timeout(timeout);
        if idle {
            self.services.relay.flush();
        }
        idle
    }
}

impl Drop for WatermarkService {
    fn drop(&mut self) {
        self.stop();
    }
}
