use std::collections::HashMap;
use std::sync::RwLock;

use super::{JobStore, StoreError};
use crate::job::{JobFilter, JobId, JobSnapshot, JobUpdate, NewJob};

/// In-process job store backed by a `RwLock<HashMap>`.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobSnapshot>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, new: NewJob) -> Result<JobSnapshot, StoreError> {
        let job = JobSnapshot::admitted(new);
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(job)
    }

    fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs.get(id).cloned())
    }

    fn update(&self, id: &JobId, update: &JobUpdate) -> Result<JobSnapshot, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;
        job.apply(update).map_err(|source| StoreError::Rejected {
            id: id.clone(),
            source,
        })?;
        Ok(job.clone())
    }

    fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(jobs.remove(id).is_some())
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobSnapshot>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut matching: Vec<JobSnapshot> = jobs
            .values()
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}
