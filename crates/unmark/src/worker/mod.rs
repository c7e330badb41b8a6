pub mod cancel;
pub mod finalize;
pub mod pool;
pub mod queue;

use std::sync::Arc;

pub use cancel::CancellationRegistry;
pub use finalize::{FileCleanup, Finalizer};
pub use pool::WorkerPool;
pub use queue::{Dequeued, QueuedJob, TaskGuard, TaskQueue};

use crate::broadcast::{JobProgressBroadcaster, ProgressRelay};
use crate::config::RetryConfig;
use crate::error::WorkerError;
use crate::store::{JobStore, MemoryJobStore};

/// The shared components every job execution path needs.
///
/// Built once per process and handed by clone to the worker pool and any
/// batch coordinator, so both observe the same records and cancel flags.
#[derive(Clone)]
pub struct JobServices {
    pub store: Arc<dyn JobStore>,
    pub registry: Arc<CancellationRegistry>,
    pub broadcaster: JobProgressBroadcaster,
    pub relay: Arc<ProgressRelay>,
    pub finalizer: Arc<Finalizer>,
}

impl JobServices {
    pub fn new(
        store: Arc<dyn JobStore>,
        retry: RetryConfig,
        download_url_prefix: &str,
    ) -> Result<Self, WorkerError> {
        let registry = Arc::new(CancellationRegistry::new());
        let broadcaster = JobProgressBroadcaster::default();
        let relay = Arc::new(ProgressRelay::spawn(
            Arc::clone(&store),
            broadcaster.clone(),
        )?);
        let finalizer = Arc::new(Finalizer::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            broadcaster.clone(),
            retry,
            download_url_prefix,
        ));

        Ok(Self {
            store,
            registry,
            broadcaster,
            relay,
            finalizer,
        })
    }

    /// Memory-backed services with default retry settings.
    pub fn in_memory() -> Result<Self, WorkerError> {
        Self::new(
            Arc::new(MemoryJobStore::new()),
            RetryConfig::default(),
            "/download/",
        )
    }
}
