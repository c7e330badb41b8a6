pub mod coordinator;
pub mod discover;
pub mod report;

pub use coordinator::{BatchCoordinator, BatchJob, BatchPlan};
pub use discover::{discover_inputs, jobs_for_directory};
pub use report::{
    BatchProgress, BatchProgressReporter, BatchResult, BatchStats, BatchTask,
    BroadcastBatchProgress, FailedTask, NoopBatchProgress,
};
