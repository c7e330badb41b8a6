//! Versioned schema setup.
//!
//! The applied version is kept in SQLite's `user_version` pragma. Each
//! step runs in its own transaction together with the version bump, so a
//! failed step leaves the previous version intact.

use rusqlite::Connection;

use super::error::DatabaseError;

/// Schema steps in order. Step `i` upgrades the schema to version `i + 1`.
const STEPS: &[(&str, &str)] = &[("create_jobs", include_str!("sql/001_create_jobs.sql"))];

/// Highest schema version this build understands.
pub fn latest_version() -> u32 {
    STEPS.len() as u32
}

/// Reads the schema version recorded in the database.
pub fn current_version(conn: &Connection) -> Result<u32, DatabaseError> {
    Ok(conn.query_row("PRAGMA user_version", [], |r| r.get(0))?)
}

/// Brings the schema up to [`latest_version`].
///
/// A database written by a newer build is refused rather than opened with
/// a schema this code does not know.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    let current = current_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(DatabaseError::Migration {
            version: current,
            reason: format!("schema is newer than supported version {}", latest),
        });
    }

    for (index, (name, sql)) in STEPS.iter().enumerate().skip(current as usize) {
        let version = index as u32 + 1;
        log::info!("Applying schema v{}: {}", version, name);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(sql)
            .and_then(|()| tx.pragma_update(None, "user_version", version))
            .map_err(|e| DatabaseError::Migration {
                version,
                reason: e.to_string(),
            })?;
        tx.commit()?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_reaches_latest() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), latest_version());

        let priority_columns: u32 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('jobs') WHERE name = 'priority'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(priority_columns, 1);
    }

    #[test]
    fn test_rerun_is_noop() {
        let conn = Connection::open_in_memory().unwrap();
        run_all(&conn).unwrap();
        conn.execute(
            "INSERT INTO jobs (id, created_at, updated_at) VALUES ('a', 'x', 'x')",
            [],
        )
        .unwrap();
        run_all(&conn).unwrap();

        let rows: u32 = conn
            .query_row("SELECT COUNT(*) FROM jobs", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", latest_version() + 1)
            .unwrap();
        assert!(matches!(
            run_all(&conn),
            Err(DatabaseError::Migration { .. })
        ));
    }
}
