//! Job lifecycle states and the transitions allowed between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a job.
///
/// ```text
/// UPLOADING ──► PROCESSING ──► FINISHED | ERROR | CANCELLED
///     │
///     └────────► ERROR | CANCELLED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Uploading,
    Processing,
    Finished,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Terminal states have no outgoing edges.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Error | JobStatus::Cancelled
        )
    }

    /// Returns true if `next` is a valid edge out of `self`.
    ///
    /// Self-loops are not edges: a second move into `PROCESSING` is rejected,
    /// which is what keeps a job from being queued twice.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Uploading, Processing)
                | (Uploading, Cancelled)
                | (Uploading, Error)
                | (Processing, Finished)
                | (Processing, Error)
                | (Processing, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Uploading => "UPLOADING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Error => "ERROR",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown job status '{0}'")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOADING" => Ok(JobStatus::Uploading),
            "PROCESSING" => Ok(JobStatus::Processing),
            "FINISHED" => Ok(JobStatus::Finished),
            "ERROR" => Ok(JobStatus::Error),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}
