use crate::db::job_repo::{self, JobRow};
use crate::db::{Database, DatabaseError};
use crate::job::{JobFilter, JobId, JobSnapshot, JobUpdate, NewJob, UpdateRejected};

use super::{JobStore, StoreError};

/// Job store persisted in SQLite.
///
/// Updates read, validate and write the row inside one `with_conn` section.
#[derive(Clone)]
pub struct SqliteJobStore {
    db: Database,
}

impl SqliteJobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

enum UpdateOutcome {
    Applied(JobSnapshot),
    Missing,
    Rejected(UpdateRejected),
}

impl JobStore for SqliteJobStore {
    fn create(&self, new: NewJob) -> Result<JobSnapshot, StoreError> {
        let job = JobSnapshot::admitted(new);
        let row = JobRow::from_snapshot(&job);
        self.db.with_conn(|conn| job_repo::insert(conn, &row))?;
        log::debug!("Created job {}", job.id);
        Ok(job)
    }

    fn get(&self, id: &JobId) -> Result<Option<JobSnapshot>, StoreError> {
        let row = self
            .db
            .with_conn(|conn| job_repo::find_by_id(conn, id.as_str()))?;
        Ok(row.map(JobRow::into_snapshot).transpose()?)
    }

    fn update(&self, id: &JobId, update: &JobUpdate) -> Result<JobSnapshot, StoreError> {
        let outcome = self.db.with_conn(|conn| {
            let Some(row) = job_repo::find_by_id(conn, id.as_str())? else {
                return Ok(UpdateOutcome::Missing);
            };
            let mut job = row.into_snapshot()?;
            if let Err(rejected) = job.apply(update) {
                return Ok(UpdateOutcome::Rejected(rejected));
            }
            job_repo::update(conn, &JobRow::from_snapshot(&job))?;
            Ok::<_, DatabaseError>(UpdateOutcome::Applied(job))
        })?;

        match outcome {
            UpdateOutcome::Applied(job) => Ok(job),
            UpdateOutcome::Missing => Err(StoreError::NotFound(id.clone())),
            UpdateOutcome::Rejected(source) => Err(StoreError::Rejected {
                id: id.clone(),
                source,
            }),
        }
    }

    fn delete(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self
            .db
            .with_conn(|conn| job_repo::delete(conn, id.as_str()))?)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<JobSnapshot>, StoreError> {
        let rows = self.db.with_conn(|conn| job_repo::query(conn, filter))?;
        rows.into_iter()
            .map(|row| row.into_snapshot().map_err(StoreError::from))
            .collect()
    }
}
