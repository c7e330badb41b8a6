//! Job repository: CRUD operations for the `jobs` table.
//!
//! Functions take a `&Connection` so the store can compose a read and a
//! write inside a single `Database::with_conn` section.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::DatabaseError;
use crate::job::{JobFilter, JobId, JobSnapshot, JobStatus};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub status: String,
    pub percent: i64,
    pub priority: i64,
    pub input_path: Option<String>,
    pub output_path: Option<String>,
    pub download_url: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub updated_at: String,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            status: row.get("status")?,
            percent: row.get("percent")?,
            priority: row.get("priority")?,
            input_path: row.get("input_path")?,
            output_path: row.get("output_path")?,
            download_url: row.get("download_url")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            ended_at: row.get("ended_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn from_snapshot(job: &JobSnapshot) -> Self {
        Self {
            id: job.id.to_string(),
            status: job.status.as_str().to_string(),
            percent: i64::from(job.percent),
            priority: i64::from(job.priority),
            input_path: job.input_path.as_deref().map(path_to_string),
            output_path: job.output_path.as_deref().map(path_to_string),
            download_url: job.download_url.clone(),
            error: job.error.clone(),
            created_at: format_timestamp(job.created_at),
            started_at: job.started_at.map(format_timestamp),
            ended_at: job.ended_at.map(format_timestamp),
            updated_at: format_timestamp(Utc::now()),
        }
    }

    pub fn into_snapshot(self) -> Result<JobSnapshot, DatabaseError> {
        let status: JobStatus = self.status.parse().map_err(|e| DatabaseError::Decode {
            column: "status",
            reason: format!("{}", e),
        })?;
        let percent = u8::try_from(self.percent.clamp(0, 100)).unwrap_or(0);
        let priority = i32::try_from(self.priority).map_err(|e| DatabaseError::Decode {
            column: "priority",
            reason: e.to_string(),
        })?;

        Ok(JobSnapshot {
            id: JobId::from(self.id),
            status,
            percent,
            input_path: self.input_path.map(PathBuf::from),
            output_path: self.output_path.map(PathBuf::from),
            download_url: self.download_url,
            priority,
            error: self.error,
            created_at: parse_timestamp("created_at", &self.created_at)?,
            started_at: self
                .started_at
                .as_deref()
                .map(|s| parse_timestamp("started_at", s))
                .transpose()?,
            ended_at: self
                .ended_at
                .as_deref()
                .map(|s| parse_timestamp("ended_at", s))
                .transpose()?,
        })
    }
}

fn path_to_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_timestamp(column: &'static str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Decode {
            column,
            reason: format!("'{}': {}", s, e),
        })
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, status, percent, priority, input_path, output_path,
         download_url, error, created_at, started_at, ended_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            job.id,
            job.status,
            job.percent,
            job.priority,
            job.input_path,
            job.output_path,
            job.download_url,
            job.error,
            job.created_at,
            job.started_at,
            job.ended_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Updates an existing job row. All fields except `id` and `created_at` are overwritten.
pub fn update(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET status=?2, percent=?3, priority=?4, input_path=?5, output_path=?6,
         download_url=?7, error=?8, started_at=?9, ended_at=?10, updated_at=?11
         WHERE id=?1",
        params![
            job.id,
            job.status,
            job.percent,
            job.priority,
            job.input_path,
            job.output_path,
            job.download_url,
            job.error,
            job.started_at,
            job.ended_at,
            job.updated_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM jobs WHERE id = ?1",
            params![id],
            JobRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// Deletes a job by its ID. Returns true if a row was removed.
pub fn delete(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let affected = conn.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
    Ok(affected > 0)
}

/// Lists jobs matching the filter, oldest first.
pub fn query(conn: &Connection, filter: &JobFilter) -> Result<Vec<JobRow>, DatabaseError> {
    let limit = filter
        .limit
        .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
        .unwrap_or(-1);

    let rows = match filter.status {
        Some(status) => {
            let mut stmt = conn.prepare(
                "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(params![status.as_str(), limit], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
        None => {
            let mut stmt = conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC LIMIT ?1")?;
            let rows = stmt
                .query_map(params![limit], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        }
    };

    Ok(rows)
}
