//! Batch coordinator: bounded fan-out, aggregation, cancellation, timeouts.

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use unmark::batch::{BatchCoordinator, BatchJob, BatchResult, BroadcastBatchProgress};
use unmark::config::RetryConfig;
use unmark::job::{JobFilter, JobId, JobSnapshot, JobStatus, JobUpdate, NewJob};
use unmark::store::{JobStore, MemoryJobStore, StoreError};
use unmark::transform::{TransformContext, TransformError, VideoTransform};
use unmark::{JobServices, UnmarkError, ValidationError};

/// Sleeps for a per-file duration before copying the input.
struct TimedTransform {
    durations: HashMap<String, Duration>,
}

impl VideoTransform for TimedTransform {
    fn run(&self, input: &Path, output: &Path, _: &TransformContext) -> Result<(), TransformError> {
        let name = input.file_name().unwrap().to_string_lossy().into_owned();
        std::thread::sleep(self.durations.get(&name).copied().unwrap_or_default());
        std::fs::copy(input, output).map_err(|source| TransformError::Io {
            path: input.to_path_buf(),
            source,
        })?;
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_succeed_two_fail() {
    let harness = TestHarness::new();
    let (services, coordinator) = harness.coordinator(Arc::new(FailingTransform));
    let jobs = harness.batch_jobs(&["a.mp4", "bad_1.mp4", "b.mp4", "bad_2.mp4", "c.mp4"]);

    let result = coordinator.submit_batch(jobs, 2).await.unwrap();

    assert_eq!(result.stats.total, 5);
    assert_eq!(result.stats.completed, 3);
    assert_eq!(result.stats.failed, 2);
    assert_eq!(result.stats.cancelled, 0);
    assert!(!result.success);
    assert!(result.stats.throughput_per_minute > 0.0);
    assert!(result.stats.peak_concurrency <= 2);

    for task in &result.completed {
        assert_eq!(task.job.status, JobStatus::Finished);
        assert_eq!(task.job.percent, 100);
        assert!(task.job.download_url.is_some());
        assert!(task.job.output_path.as_ref().unwrap().exists());
        assert!(task.processing_time.is_some());
    }
    for failed in &result.failed {
        assert!(failed.error.contains("cannot decode"));
        let stored = services.store.get(&failed.job.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.percent, 0);
        assert!(stored.download_url.is_none());
    }

    let report = harness.output_dir.join("batch_results.json");
    result.save(&report).unwrap();
    let loaded: BatchResult =
        serde_json::from_str(&std::fs::read_to_string(&report).unwrap()).unwrap();
    assert_eq!(loaded.stats, result.stats);
    assert_eq!(loaded.failed.len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_never_more_than_limit_in_flight() {
    let harness = TestHarness::new();
    let gate = Arc::new(GatedTransform::new());
    let (_services, coordinator) = harness.coordinator(gate.clone());
    let jobs = harness.batch_jobs(&["1.mp4", "2.mp4", "3.mp4", "4.mp4", "5.mp4"]);

    let plan = coordinator.admit(jobs, 2).unwrap();
    let run = tokio::spawn(async move { coordinator.run(plan).await });

    let observer = gate.clone();
    let two_running = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(5), || observer.started() == 2)
    })
    .await
    .unwrap();
    assert!(two_running);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gate.started(), 2);
    assert!(gate.in_flight() <= 2);

    gate.release();
    let result = run.await.unwrap();

    assert!(result.success);
    assert_eq!(result.stats.completed, 5);
    assert_eq!(gate.peak(), 2);
    assert_eq!(result.stats.peak_concurrency, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_window_slides_as_jobs_finish() {
    let harness = TestHarness::new();
    let durations = HashMap::from([
        ("slow.mp4".to_string(), Duration::from_millis(600)),
        ("fast.mp4".to_string(), Duration::from_millis(20)),
        ("next.mp4".to_string(), Duration::from_millis(20)),
    ]);
    let (_services, coordinator) = harness.coordinator(Arc::new(TimedTransform { durations }));
    let jobs = harness.batch_jobs(&["slow.mp4", "fast.mp4", "next.mp4"]);

    let result = coordinator.submit_batch(jobs, 2).await.unwrap();
    assert_eq!(result.stats.completed, 3);

    let by_name = |name: &str| {
        result
            .completed
            .iter()
            .find(|t| t.job.input_path.as_ref().unwrap().ends_with(name))
            .unwrap()
            .clone()
    };
    let slow = by_name("slow.mp4");
    let next = by_name("next.mp4");
    assert!(
        next.started_at.unwrap() < slow.finished_at.unwrap(),
        "third job waited for the whole first window"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_batch_dispatches_by_priority() {
    let harness = TestHarness::new();
    let transform = Arc::new(CountingTransform::new());
    let (_services, coordinator) = harness.coordinator(transform.clone());

    let jobs = vec![
        BatchJob::new(harness.write_video("p3.mp4"), harness.output_dir.join("p3.mp4")).with_priority(3),
        BatchJob::new(harness.write_video("p1.mp4"), harness.output_dir.join("p1.mp4")).with_priority(1),
        BatchJob::new(harness.write_video("p2.mp4"), harness.output_dir.join("p2.mp4")).with_priority(2),
    ];
    let result = coordinator.submit_batch(jobs, 1).await.unwrap();

    assert!(result.success);
    assert_eq!(transform.order(), vec!["p1.mp4", "p2.mp4", "p3.mp4"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancelled_before_dispatch_is_not_a_failure() {
    let harness = TestHarness::new();
    let transform = Arc::new(CountingTransform::new());
    let service = harness.service(transform.clone(), 1);
    let coordinator = service.batch_coordinator(&harness.batch_config());
    let jobs = harness.batch_jobs(&["keep.mp4", "skip.mp4"]);
    let skipped_input = jobs[1].input_path.clone();

    let plan = coordinator.admit(jobs, 1).unwrap();
    let ids = plan.job_ids();
    let summary = service.cancel_tasks(&ids[1..]).unwrap();
    assert_eq!(summary.finalized, 1);

    let result = coordinator.run(plan).await;

    assert!(result.success);
    assert_eq!(result.stats.completed, 1);
    assert_eq!(result.stats.cancelled, 1);
    assert_eq!(result.cancelled[0].job.id, ids[1]);
    assert_eq!(result.cancelled[0].job.status, JobStatus::Cancelled);
    assert_eq!(transform.total_calls(), 1);
    assert!(skipped_input.exists(), "batch inputs belong to the caller");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_mid_flight_in_batch() {
    let harness = TestHarness::new();
    let transform = Arc::new(ScriptedTransform::new(5).pausing_after(2));
    let service = harness.service(transform.clone(), 1);
    let coordinator = service.batch_coordinator(&harness.batch_config());
    let jobs = harness.batch_jobs(&["long.mp4"]);
    let output = jobs[0].output_path.clone();

    let plan = coordinator.admit(jobs, 1).unwrap();
    let ids = plan.job_ids();
    let run = tokio::spawn(async move { coordinator.run(plan).await });

    let observer = transform.clone();
    assert!(tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(5), || observer.executed() == 2)
    })
    .await
    .unwrap());
    assert_eq!(service.cancel_tasks(&ids).unwrap().flagged, 1);

    let result = run.await.unwrap();
    assert!(result.success);
    assert_eq!(result.stats.cancelled, 1);
    assert_eq!(transform.executed(), 2);
    assert!(!output.exists());

    let job = service.job(&ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.percent, 0);
    assert!(service.services().registry.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_job_is_error_and_abandoned() {
    let harness = TestHarness::new();
    let transform = Arc::new(HangingTransform::new());
    let (services, coordinator) = harness.coordinator(transform.clone());
    let coordinator = coordinator.with_job_timeout(Some(Duration::from_millis(150)));
    let jobs = harness.batch_jobs(&["hang.mp4"]);

    let clock = Instant::now();
    let result = coordinator.submit_batch(jobs, 1).await.unwrap();
    assert!(clock.elapsed() < Duration::from_secs(5));

    assert!(!result.success);
    assert_eq!(result.failed.len(), 1);
    assert!(result.failed[0].error.contains("budget"));
    let stored = services.store.get(&result.failed[0].job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Error);

    let observer = transform.clone();
    assert!(tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(5), || observer.observed_cancel() == 1)
    })
    .await
    .unwrap());
}

/// Ignores cancellation and writes its output well after any short budget.
#[derive(Default)]
struct LateWriter {
    done: AtomicBool,
}

impl VideoTransform for LateWriter {
    fn run(&self, input: &Path, output: &Path, _: &TransformContext) -> Result<(), TransformError> {
        std::thread::sleep(Duration::from_millis(300));
        std::fs::copy(input, output).map_err(|source| TransformError::Io {
            path: input.to_path_buf(),
            source,
        })?;
        self.done.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_job_leaves_no_late_output() {
    let harness = TestHarness::new();
    let transform = Arc::new(LateWriter::default());
    let (services, coordinator) = harness.coordinator(transform.clone());
    let coordinator = coordinator.with_job_timeout(Some(Duration::from_millis(50)));
    let jobs = harness.batch_jobs(&["late.mp4"]);
    let output = jobs[0].output_path.clone();

    let result = coordinator.submit_batch(jobs, 1).await.unwrap();
    assert_eq!(result.failed.len(), 1);
    let id = result.failed[0].job.id.clone();

    let observer = transform.clone();
    let cleaned = tokio::task::spawn_blocking(move || {
        wait_until(Duration::from_secs(5), || observer.done.load(Ordering::SeqCst))
            && wait_until(Duration::from_secs(2), || !output.exists())
    })
    .await
    .unwrap();
    assert!(cleaned, "output written after the timeout was left behind");
    assert_eq!(
        services.store.get(&id).unwrap().unwrap().status,
        JobStatus::Error
    );
}

/// Panics the first time a job is claimed, outside the transform.
#[derive(Default)]
struct PanicOnFirstClaim {
    inner: MemoryJobStore,
    fired: AtomicBool,
}

impl JobStore for PanicOnFirstClaim {
    fn create(&self, new: NewJob) -> Result<JobSnapshot, StoreError> {
        self.inner.create(new)
    }

    fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, StoreError> {
        self.inner.get(id)
    }

    fn update(&self, id: &JobId, update: &JobUpdate) -> Result<JobSnapshot, StoreError> {
        if update.started_at.is_some() && !self.fired.swap(true, Ordering::SeqCst) {
            panic!("store crashed while claiming {}", id);
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

#[tokio::test(flavor = "multi_thread")]
async fn test_aborted_task_is_reported_as_failed() {
    let harness = TestHarness::new();
    let store = Arc::new(PanicOnFirstClaim::default());
    let services = JobServices::new(store, RetryConfig::default(), "/download/").unwrap();
    let coordinator = BatchCoordinator::new(
        services.clone(),
        Arc::new(CountingTransform::new()),
        &harness.batch_config(),
    );
    let jobs = harness.batch_jobs(&["a.mp4", "b.mp4", "c.mp4"]);

    let result = coordinator.submit_batch(jobs, 1).await.unwrap();

    assert_eq!(result.stats.total, 3);
    assert_eq!(result.completed.len(), 2);
    assert_eq!(result.failed.len(), 1);
    assert!(!result.success);
    assert!(result.failed[0].error.contains("aborted"));
    let stored = services.store.get(&result.failed[0].job.id).unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Error);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_reported_per_completion_and_temp_dirs_removed() {
    let harness = TestHarness::new();
    let progress = BroadcastBatchProgress::default();
    let mut updates = progress.subscribe();
    let (_services, coordinator) = harness.coordinator(Arc::new(FailingTransform));
    let coordinator = coordinator.with_reporter(Arc::new(progress.clone()));
    let jobs = harness.batch_jobs(&["a.mp4", "bad.mp4", "b.mp4"]);

    let result = coordinator.submit_batch(jobs, 3).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|u| u.batch_id == result.batch_id && u.total == 3));
    let last = seen.last().unwrap();
    assert_eq!(last.progress_percent, 100.0);
    assert_eq!(last.completed + last.failed, 3);
    assert_eq!(last.eta_seconds, 0.0);

    let leftover = std::fs::read_dir(harness.batch_config().temp_directory)
        .unwrap()
        .count();
    assert_eq!(leftover, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_batches_are_rejected_before_admission() {
    let harness = TestHarness::new();
    let (services, coordinator) = harness.coordinator(Arc::new(CountingTransform::new()));

    let text = harness.input_dir.join("notes.txt");
    std::fs::write(&text, b"hello").unwrap();
    let good = harness.batch_jobs(&["ok.mp4"]);
    let mut mixed = good.clone();
    mixed.push(BatchJob::new(&text, harness.output_dir.join("notes.mp4")));

    assert!(matches!(
        coordinator.submit_batch(mixed, 2).await,
        Err(UnmarkError::Validation(ValidationError::NotAVideo { .. }))
    ));
    assert!(matches!(
        coordinator.submit_batch(good, 0).await,
        Err(UnmarkError::Validation(ValidationError::ZeroConcurrency))
    ));
    assert!(services
        .store
        .list(&unmark::job::JobFilter::default())
        .unwrap()
        .is_empty());
}
