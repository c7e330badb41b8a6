//! Batch bookkeeping, aggregate statistics and progress reporting.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::JobSnapshot;

/// A job plus its execution bookkeeping for one batch run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchTask {
    pub job: JobSnapshot,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Seconds spent inside the transform.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTask {
    pub job: JobSnapshot,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub elapsed_seconds: f64,
    /// Mean processing time over successful jobs only.
    pub avg_seconds_per_job: f64,
    /// Successful jobs per minute of wall time.
    pub throughput_per_minute: f64,
    pub peak_concurrency: usize,
}

impl BatchStats {
    pub fn compute(
        total: usize,
        completed: &[BatchTask],
        failed: usize,
        cancelled: usize,
        elapsed: Duration,
        peak_concurrency: usize,
    ) -> Self {
        let elapsed_seconds = elapsed.as_secs_f64();
        let avg_seconds_per_job = if completed.is_empty() {
            0.0
        } else {
            completed
                .iter()
                .filter_map(|t| t.processing_time)
                .sum::<f64>()
                / completed.len() as f64
        };
        let throughput_per_minute = if elapsed_seconds > 0.0 {
            completed.len() as f64 / (elapsed_seconds / 60.0)
        } else {
            0.0
        };

        Self {
            total,
            completed: completed.len(),
            failed,
            cancelled,
            elapsed_seconds,
            avg_seconds_per_job,
            throughput_per_minute,
            peak_concurrency,
        }
    }
}

/// Consolidated outcome of a batch.
///
/// `success` is true iff no job failed. Cancelled jobs are listed
/// separately and do not affect the verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResult {
    pub batch_id: String,
    pub success: bool,
    pub completed: Vec<BatchTask>,
    pub failed: Vec<FailedTask>,
    pub cancelled: Vec<BatchTask>,
    pub stats: BatchStats,
}

impl BatchResult {
    /// Writes the result as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }
}

/// Snapshot emitted after every job completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub batch_id: String,
    pub progress_percent: f64,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    pub eta_seconds: f64,
    pub concurrent_active: usize,
}

impl BatchProgress {
    /// ETA is `remaining * mean_time_of_finished / concurrency_limit`.
    pub fn estimate(
        batch_id: &str,
        finished: &[BatchTask],
        counts: (usize, usize, usize),
        total: usize,
        concurrency_limit: usize,
        concurrent_active: usize,
    ) -> Self {
        let (completed, failed, cancelled) = counts;
        let done = finished.len();
        let progress_percent = if total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / total as f64
        };
        let eta_seconds = if done == 0 {
            0.0
        } else {
            let mean = finished
                .iter()
                .filter_map(|t| t.processing_time)
                .sum::<f64>()
                / done as f64;
            total.saturating_sub(done) as f64 * mean / concurrency_limit.max(1) as f64
        };

        Self {
            batch_id: batch_id.to_string(),
            progress_percent,
            completed,
            failed,
            cancelled,
            total,
            eta_seconds,
            concurrent_active,
        }
    }
}

pub trait BatchProgressReporter: Send + Sync {
    fn report(&self, progress: &BatchProgress);
}

/// No-op reporter.
pub struct NoopBatchProgress;

impl BatchProgressReporter for NoopBatchProgress {
    fn report(&self, _progress: &BatchProgress) {}
}

/// Publishes batch progress on a broadcast channel.
#[derive(Clone)]
pub struct BroadcastBatchProgress {
    sender: Arc<broadcast::Sender<BatchProgress>>,
}

impl BroadcastBatchProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchProgress> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBatchProgress {
    fn default() -> Self {
        Self::new(100)
    }
}

impl BatchProgressReporter for BroadcastBatchProgress {
    fn report(&self, progress: &BatchProgress) {
        let _ = self.sender.send(progress.clone());
    }
}
