//! Broadcasting and relaying of job progress.

pub mod job_progress;
pub mod relay;

pub use job_progress::{JobProgressBroadcaster, JobProgressEvent};
pub use relay::{ProgressRelay, ProgressReporter};
