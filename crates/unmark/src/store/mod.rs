//! Job store: the single source of truth for job records.
//!
//! Every mutation goes through [`JobStore::update`], which validates the
//! change against the job state machine and applies it atomically.
//! Readers always get an owned [`JobSnapshot`], never a live reference.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::job::{JobFilter, JobId, JobSnapshot, JobUpdate, NewJob, UpdateRejected};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Update to job {id} rejected: {source}")]
    Rejected {
        id: JobId,
        #[source]
        source: UpdateRejected,
    },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Store lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// A rejection is a permanent answer; retrying the same update cannot succeed.
    pub fn is_rejection(&self) -> bool {
        matches!(self, StoreError::Rejected { .. } | StoreError::NotFound(_))
    }
}

/// Keyed storage of job records.
///
/// Implementations must make `update` atomic per job: the read, the state
/// machine check and the write happen without another update to the same
/// job interleaving.
pub trait JobStore: Send + Sync {
    /// Creates a new record in `UPLOADING`.
    fn create(&self, new: NewJob) -> Result<JobSnapshot, StoreError>;

    fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, StoreError>;

    /// Applies a partial update and returns the resulting snapshot.
    fn update(&self, id: &JobId, update: &JobUpdate) -> Result<JobSnapshot, StoreError>;

    /// Removes a record. Returns false if it did not exist.
    fn delete(&self, id: &JobId) -> Result<bool, StoreError>;

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobSnapshot>, StoreError>;
}
