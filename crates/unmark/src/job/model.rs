//! Job records and the partial updates applied to them.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::status::JobStatus;

/// Opaque job identifier, assigned at admission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Parameters for creating a job record.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    /// Lower is served first.
    pub priority: i32,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

impl NewJob {
    pub fn with_priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

/// A point-in-time copy of a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub status: JobStatus,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    pub priority: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    /// Builds the initial `UPLOADING` record for a new job.
    pub fn admitted(new: NewJob) -> Self {
        Self {
            id: JobId::new(),
            status: JobStatus::Uploading,
            percent: 0,
            input_path: new.input_path,
            output_path: new.output_path,
            download_url: None,
            priority: new.priority,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Queued but not yet claimed by a worker.
    pub fn is_queued(&self) -> bool {
        self.status == JobStatus::Processing && self.started_at.is_none()
    }

    /// True for a claimed job whose `started_at` is older than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match (self.status, self.started_at) {
            (JobStatus::Processing, Some(started)) => now - started > threshold,
            _ => false,
        }
    }

    /// Applies a partial update, enforcing the job state machine.
    ///
    /// On rejection the snapshot is left untouched.
    pub fn apply(&mut self, update: &JobUpdate) -> Result<(), UpdateRejected> {
        if self.status.is_terminal() {
            return Err(UpdateRejected::Terminal {
                status: self.status,
            });
        }

        if update.require_unstarted && self.started_at.is_some() {
            return Err(UpdateRejected::AlreadyStarted);
        }

        let next_status = match update.status {
            Some(next) if !self.status.can_transition_to(next) => {
                return Err(UpdateRejected::InvalidTransition {
                    from: self.status,
                    to: next,
                });
            }
            Some(next) => next,
            None => self.status,
        };

        if update.started_at.is_some() {
            if self.started_at.is_some() {
                return Err(UpdateRejected::AlreadyStarted);
            }
            if next_status != JobStatus::Processing {
                return Err(UpdateRejected::NotProcessing {
                    status: next_status,
                });
            }
        }

        if update.status.is_none() {
            if let Some(percent) = update.percent {
                if self.status != JobStatus::Processing {
                    return Err(UpdateRejected::NotProcessing {
                        status: self.status,
                    });
                }
                if percent < self.percent {
                    return Err(UpdateRejected::PercentRegressed {
                        current: self.percent,
                        requested: percent,
                    });
                }
            }
        }

        check_set_once("input_path", &self.input_path, &update.input_path)?;
        check_set_once("output_path", &self.output_path, &update.output_path)?;

        self.status = next_status;
        if let Some(percent) = update.percent {
            self.percent = percent;
        }
        if let Some(ref path) = update.input_path {
            self.input_path = Some(path.clone());
        }
        if let Some(ref path) = update.output_path {
            self.output_path = Some(path.clone());
        }
        if let Some(ref url) = update.download_url {
            self.download_url = url.clone();
        }
        if let Some(ref error) = update.error {
            self.error = Some(error.clone());
        }
        if let Some(started) = update.started_at {
            self.started_at = Some(started);
        }
        if let Some(ended) = update.ended_at {
            self.ended_at = Some(ended);
        }

        Ok(())
    }
}

fn check_set_once(
    field: &'static str,
    current: &Option<PathBuf>,
    requested: &Option<PathBuf>,
) -> Result<(), UpdateRejected> {
    match (current, requested) {
        (Some(existing), Some(new)) if existing != new => Err(UpdateRejected::ImmutableField(field)),
        _ => Ok(()),
    }
}

/// Why the state machine refused an update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateRejected {
    #[error("job is already {status}")]
    Terminal { status: JobStatus },

    #[error("transition {from} -> {to} is not allowed")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job has already been started by a worker")]
    AlreadyStarted,

    #[error("job is {status}, not PROCESSING")]
    NotProcessing { status: JobStatus },

    #[error("percent would regress from {current} to {requested}")]
    PercentRegressed { current: u8, requested: u8 },

    #[error("field '{0}' is already set")]
    ImmutableField(&'static str),
}

/// A partial, atomic update to one job record.
///
/// Use the named constructors; each one describes one step of the lifecycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub percent: Option<u8>,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
    /// `Some(None)` clears the URL.
    pub download_url: Option<Option<String>>,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Reject the update if a worker has already claimed the job.
    pub require_unstarted: bool,
}

impl JobUpdate {
    /// Upload finished: record the input and hand the job to the queue.
    pub fn queued(input_path: &Path) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            percent: Some(0),
            input_path: Some(input_path.to_path_buf()),
            ..Default::default()
        }
    }

    /// A worker claims the job. Accepted at most once per job.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            percent: Some(0),
            started_at: Some(at),
            ..Default::default()
        }
    }

    pub fn progress(percent: u8) -> Self {
        Self {
            percent: Some(percent.min(100)),
            ..Default::default()
        }
    }

    pub fn finished(output_path: &Path, download_url: String, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Finished),
            percent: Some(100),
            output_path: Some(output_path.to_path_buf()),
            download_url: Some(Some(download_url)),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Error),
            percent: Some(0),
            download_url: Some(None),
            error: Some(message.into()),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    pub fn cancelled(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Cancelled),
            percent: Some(0),
            download_url: Some(None),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    /// Restricts this update to jobs no worker has claimed yet.
    pub fn unless_started(mut self) -> Self {
        self.require_unstarted = true;
        self
    }
}

/// Filter for listing job records.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            limit: None,
        }
    }
}
