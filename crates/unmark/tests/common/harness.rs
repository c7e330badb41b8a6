//! Test harness for isolated test execution.
//!
//! The `TestHarness` owns a temporary directory with `input/`, `work/` and
//! `output/` subdirectories and builds services and batch coordinators
//! rooted inside it.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use unmark::batch::{BatchCoordinator, BatchJob};
use unmark::config::{BatchConfig, RetryConfig, ServiceConfig};
use unmark::job::{JobId, JobSnapshot};
use unmark::{JobServices, JobStore, VideoTransform, WatermarkService};

pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub work_dir: PathBuf,
    pub output_dir: PathBuf,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let base = temp_dir.path();

        let input_dir = base.join("input");
        let work_dir = base.join("work");
        let output_dir = base.join("output");

        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");
        std::fs::create_dir_all(&work_dir).expect("Failed to create work dir");
        std::fs::create_dir_all(&output_dir).expect("Failed to create output dir");

        Self {
            temp_dir,
            input_dir,
            work_dir,
            output_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes a small fake video into the input directory.
    pub fn write_video(&self, filename: &str) -> PathBuf {
        let path = self.input_dir.join(filename);
        std::fs::write(&path, format!("frames of {}", filename)).expect("Failed to write input");
        path
    }

    /// A service config rooted in the harness with fast finalize retries.
    pub fn config(&self, workers: usize) -> ServiceConfig {
        ServiceConfig {
            working_directory: self.work_dir.clone(),
            worker_count: workers,
            batch: self.batch_config(),
            finalize_retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 1,
                max_delay_ms: 5,
            },
            ..ServiceConfig::default()
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            temp_directory: self.temp_path().join("tmp_batch"),
            ..BatchConfig::default()
        }
    }

    pub fn service(&self, transform: Arc<dyn VideoTransform>, workers: usize) -> WatermarkService {
        WatermarkService::open(self.config(workers), transform).expect("Failed to open service")
    }

    pub fn service_with_store(
        &self,
        store: Arc<dyn JobStore>,
        transform: Arc<dyn VideoTransform>,
        workers: usize,
    ) -> WatermarkService {
        WatermarkService::with_store(self.config(workers), store, transform)
            .expect("Failed to open service")
    }

    /// Creates a job, "uploads" a fresh input for it and queues it.
    pub fn submit(&self, service: &WatermarkService, filename: &str, priority: i32) -> JobId {
        let source = self.write_video(filename);
        let job = service.create_job(priority).expect("create_job");
        let upload = service.upload_path(filename);
        std::fs::create_dir_all(upload.parent().expect("upload dir")).expect("upload dir");
        std::fs::copy(&source, &upload).expect("Failed to copy upload");
        service.queue_job(&job.id, &upload).expect("queue_job");
        job.id
    }

    pub fn coordinator(&self, transform: Arc<dyn VideoTransform>) -> (JobServices, BatchCoordinator) {
        let services = JobServices::in_memory().expect("Failed to build services");
        let coordinator = BatchCoordinator::new(services.clone(), transform, &self.batch_config());
        (services, coordinator)
    }

    /// One batch job per name, writing `cleaned_<name>` into the output dir.
    pub fn batch_jobs(&self, names: &[&str]) -> Vec<BatchJob> {
        names
            .iter()
            .map(|name| {
                BatchJob::new(
                    self.write_video(name),
                    self.output_dir.join(format!("cleaned_{}", name)),
                )
            })
            .collect()
    }

    /// Waits for the job to reach a terminal status and returns it.
    pub fn wait_terminal(&self, service: &WatermarkService, id: &JobId) -> JobSnapshot {
        let reached = wait_until(Duration::from_secs(10), || {
            service.job(id).map(|j| j.is_terminal()).unwrap_or(false)
        });
        assert!(reached, "job {} did not reach a terminal status", id);
        service.job(id).expect("job")
    }
}

/// Polls `condition` every 10ms until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
