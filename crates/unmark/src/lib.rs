pub mod batch;
pub mod broadcast;
pub mod bundle;
pub mod config;
pub mod db;
pub mod error;
pub mod job;
pub mod logging;
pub mod service;
pub mod store;
pub mod transform;
pub mod worker;

pub use batch::{BatchCoordinator, BatchJob, BatchProgress, BatchResult, BatchStats};
pub use broadcast::{JobProgressBroadcaster, JobProgressEvent};
pub use config::{load_config, ServiceConfig};
pub use error::{
    BundleError, ConfigError, Result, UnmarkError, ValidationError, WorkerError,
};
pub use job::{JobId, JobSnapshot, JobStatus};
pub use logging::{init_logging, LogFormat};
pub use service::{CancelSummary, JobStatusView, WatermarkService};
pub use store::{JobStore, MemoryJobStore, SqliteJobStore, StoreError};
pub use transform::{CommandTransform, TransformContext, TransformError, VideoTransform};
pub use worker::{CancellationRegistry, JobServices, TaskQueue, WorkerPool};
