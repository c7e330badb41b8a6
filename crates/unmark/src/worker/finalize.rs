//! Terminal-state writes.
//!
//! A terminal write that cannot be persisted would leave the job in
//! `PROCESSING` forever, so transient store failures are retried with
//! bounded exponential backoff. Rejections by the state machine are final
//! and never retried.

use std::path::Path;
use std::sync::Arc;
use std::thread;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::CancellationRegistry;
use crate::broadcast::JobProgressBroadcaster;
use crate::config::RetryConfig;
use crate::job::{JobId, JobSnapshot, JobUpdate};
use crate::store::{JobStore, StoreError};

/// Which files a cancellation removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCleanup {
    /// Uploaded input and any partial output. Used for service jobs.
    InputAndOutput,
    /// Partial output only. Used for batch jobs whose input belongs to the caller.
    OutputOnly,
}

pub struct Finalizer {
    store: Arc<dyn JobStore>,
    registry: Arc<CancellationRegistry>,
    broadcaster: JobProgressBroadcaster,
    retry: RetryConfig,
    download_url_prefix: String,
}

impl Finalizer {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<CancellationRegistry>,
        broadcaster: JobProgressBroadcaster,
        retry: RetryConfig,
        download_url_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            broadcaster,
            retry,
            download_url_prefix: download_url_prefix.into(),
        }
    }

    pub fn download_url(&self, id: &JobId) -> String {
        format!("{}{}", self.download_url_prefix, id)
    }

    /// `FINISHED`, percent 100, output path and download URL set.
    pub fn finish(&self, id: &JobId, output: &Path) -> Result<JobSnapshot, StoreError> {
        let update = JobUpdate::finished(output, self.download_url(id), Utc::now());
        let job = self.write_terminal(id, &update)?;
        info!(job_id = %id, output = %output.display(), "Job finished");
        self.broadcaster.publish(&job, "Finished");
        Ok(job)
    }

    /// `ERROR`, percent 0, message preserved.
    pub fn fail(&self, id: &JobId, message: &str) -> Result<JobSnapshot, StoreError> {
        let job = self.write_terminal(id, &JobUpdate::failed(message, Utc::now()))?;
        warn!(job_id = %id, "Job failed: {}", message);
        self.broadcaster.publish(&job, "Failed");
        Ok(job)
    }

    /// `CANCELLED`, then best-effort removal of the job's files.
    pub fn cancel(
        &self,
        id: &JobId,
        cleanup: FileCleanup,
        partial_output: Option<&Path>,
    ) -> Result<JobSnapshot, StoreError> {
        let job = self.write_terminal(id, &JobUpdate::cancelled(Utc::now()))?;
        self.after_cancel(&job, cleanup, partial_output);
        Ok(job)
    }

    /// Cancels a job only if no worker has claimed it yet.
    pub fn cancel_unstarted(
        &self,
        id: &JobId,
        cleanup: FileCleanup,
    ) -> Result<JobSnapshot, StoreError> {
        let update = JobUpdate::cancelled(Utc::now()).unless_started();
        let job = self.write_terminal(id, &update)?;
        self.after_cancel(&job, cleanup, None);
        Ok(job)
    }

    fn after_cancel(&self, job: &JobSnapshot, cleanup: FileCleanup, partial_output: Option<&Path>) {
        info!(job_id = %job.id, "Job cancelled");
        if cleanup == FileCleanup::InputAndOutput {
            if let Some(ref input) = job.input_path {
                remove_quietly(input);
            }
        }
        if let Some(output) = partial_output {
            remove_quietly(output);
        }
        self.broadcaster.publish(job, "Cancelled");
    }

    fn write_terminal(&self, id: &JobId, update: &JobUpdate) -> Result<JobSnapshot, StoreError> {
        let target = update
            .status
            .map(|s| s.as_str())
            .unwrap_or("terminal state");

        let mut attempt = 0;
        let result = loop {
            match self.store.update(id, update) {
                Ok(job) => break Ok(job),
                Err(e) if e.is_rejection() => break Err(e),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        job_id = %id,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to persist {}, retrying: {}",
                        target,
                        e
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        job_id = %id,
                        status = target,
                        attempts = attempt + 1,
                        "CRITICAL: could not persist terminal state, job may stay PROCESSING: {}",
                        e
                    );
                    break Err(e);
                }
            }
        };

        match &result {
            Ok(_) => {
                self.registry.clear(id);
            }
            Err(StoreError::Rejected { source, .. }) => {
                debug!(job_id = %id, "Terminal write to {} rejected: {}", target, source);
                if let Ok(Some(job)) = self.store.get(id) {
                    if job.is_terminal() {
                        self.registry.clear(id);
                    }
                }
            }
            Err(_) => {}
        }

        result
    }
}

/// Deletes a file, ignoring one that is already gone.
pub(crate) fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "Failed to remove file: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::job::{JobFilter, JobStatus, NewJob};
    use crate::store::MemoryJobStore;

    /// Fails the first `failures` updates with a transient error.
    struct FlakyStore {
        inner: MemoryJobStore,
        failures: AtomicU32,
    }

    impl JobStore for FlakyStore {
        fn create(&self, new: NewJob) -> Result<JobSnapshot, StoreError> {
            self.inner.create(new)
        }
        fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, StoreError> {
            self.inner.get(id)
        }
        fn update(&self, id: &JobId, update: &JobUpdate) -> Result<JobSnapshot, StoreError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(StoreError::Unavailable("disk full".to_string()));
            }
            self.inner.update(id, update)
        }
        fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
            self.inner.delete(id)
        }
        fn list(&self, filter: &JobFilter) -> Result<Vec<JobSnapshot>, StoreError> {
            self.inner.list(filter)
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 2,
        }
    }

    fn setup(failures: u32, max_retries: u32) -> (Arc<FlakyStore>, Arc<CancellationRegistry>, Finalizer, JobId) {
        let store = Arc::new(FlakyStore {
            inner: MemoryJobStore::new(),
            failures: AtomicU32::new(0),
        });
        let job = store.create(NewJob::default()).unwrap();
        store
            .update(&job.id, &JobUpdate::queued(Path::new("/in/a.mp4")))
            .unwrap();
        store.failures.store(failures, Ordering::SeqCst);

        let registry = Arc::new(CancellationRegistry::new());
        let finalizer = Finalizer::new(
            store.clone(),
            Arc::clone(&registry),
            JobProgressBroadcaster::default(),
            fast_retry(max_retries),
            "/download/",
        );
        (store, registry, finalizer, job.id)
    }

    #[test]
    fn test_finish_sets_url_and_percent() {
        let (_store, _registry, finalizer, id) = setup(0, 0);
        let job = finalizer.finish(&id, Path::new("/out/a.mp4")).unwrap();
        assert_eq!(job.status, JobStatus::Finished);
        assert_eq!(job.percent, 100);
        assert_eq!(job.download_url, Some(format!("/download/{}", id)));
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let (store, _registry, finalizer, id) = setup(3, 5);
        finalizer.fail(&id, "boom").unwrap();
        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_exhausted_retries_surface_error() {
        let (store, _registry, finalizer, id) = setup(10, 2);
        let err = finalizer.fail(&id, "boom").unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.failures.load(Ordering::SeqCst), 7);
        assert_eq!(
            store.get(&id).unwrap().unwrap().status,
            JobStatus::Processing
        );
    }

    #[test]
    fn test_cancel_removes_files_and_clears_registry() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("upload.mp4");
        let partial = dir.path().join("partial.mp4");
        std::fs::write(&input, b"in").unwrap();
        std::fs::write(&partial, b"out").unwrap();

        let store: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
        let job = store.create(NewJob::default()).unwrap();
        store.update(&job.id, &JobUpdate::queued(&input)).unwrap();

        let registry = Arc::new(CancellationRegistry::new());
        registry.request_cancel([&job.id]);
        let finalizer = Finalizer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            JobProgressBroadcaster::default(),
            fast_retry(0),
            "/download/",
        );

        let cancelled = finalizer
            .cancel(&job.id, FileCleanup::InputAndOutput, Some(&partial))
            .unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.download_url.is_none());
        assert!(!input.exists());
        assert!(!partial.exists());
        assert!(!registry.is_cancelled(&job.id));
    }

    #[test]
    fn test_rejection_is_not_retried_and_clears_registry_for_terminal() {
        let (store, registry, finalizer, id) = setup(0, 5);
        finalizer.finish(&id, Path::new("/out/a.mp4")).unwrap();
        registry.request_cancel([&id]);

        let err = finalizer
            .cancel(&id, FileCleanup::OutputOnly, None)
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(!registry.is_cancelled(&id));
        assert_eq!(
            store.get(&id).unwrap().unwrap().status,
            JobStatus::Finished
        );
    }
}
