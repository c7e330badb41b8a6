//! The video transformation collaborator.
//!
//! A [`VideoTransform`] turns one input file into one output file. It runs
//! synchronously on the calling thread, reports integer progress through
//! its [`TransformContext`] and polls the context's cancellation predicate
//! at its own checkpoints. Cancellation is cooperative: a transform that
//! never checks the predicate runs to completion.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

pub mod command;

pub use command::CommandTransform;

#[derive(Error, Debug)]
pub enum TransformError {
    /// The cancellation predicate fired and the transform stopped early.
    #[error("Transform cancelled")]
    Cancelled,

    #[error("Transform failed: {0}")]
    Failed(String),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transform exceeded its {limit:?} budget")]
    TimedOut { limit: Duration },

    #[error("Transform panicked: {0}")]
    Panicked(String),
}

impl TransformError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TransformError::Cancelled)
    }
}

type ProgressFn = Box<dyn Fn(u8) + Send + Sync>;
type CancelFn = Box<dyn Fn() -> bool + Send + Sync>;

/// Callbacks and scratch space handed to a transform for one job.
pub struct TransformContext {
    on_progress: ProgressFn,
    on_check_cancel: CancelFn,
    work_dir: PathBuf,
}

impl TransformContext {
    pub fn new<P, C>(on_progress: P, on_check_cancel: C, work_dir: impl Into<PathBuf>) -> Self
    where
        P: Fn(u8) + Send + Sync + 'static,
        C: Fn() -> bool + Send + Sync + 'static,
    {
        Self {
            on_progress: Box::new(on_progress),
            on_check_cancel: Box::new(on_check_cancel),
            work_dir: work_dir.into(),
        }
    }

    /// Reports percent complete, clamped to 100.
    pub fn report_progress(&self, percent: u8) {
        (self.on_progress)(percent.min(100));
    }

    /// Non-blocking poll of the cancellation predicate.
    pub fn is_cancelled(&self) -> bool {
        (self.on_check_cancel)()
    }

    /// Returns `Err(Cancelled)` if cancellation was requested.
    pub fn checkpoint(&self) -> Result<(), TransformError> {
        if self.is_cancelled() {
            Err(TransformError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Per-job scratch directory, removed by the caller once the job ends.
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }
}

/// Performs the actual watermark removal for one file.
pub trait VideoTransform: Send + Sync {
    fn run(&self, input: &Path, output: &Path, ctx: &TransformContext)
        -> Result<(), TransformError>;
}
