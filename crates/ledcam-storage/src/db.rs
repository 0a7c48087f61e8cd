//! Database connection management.
//!
//! Opens a fresh SQLite connection for every logical operation and closes it
//! before returning, so no lock or transaction outlives a single call.
//! Configures WAL mode and a busy timeout on each connection.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use ledcam_core::error::LedcamError;

use crate::migrations;

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle on the SQLite file backing the store.
///
/// Holds only the path; each `with_conn` call opens its own connection.
/// Writes are single autocommit statements, so they are durable by the time
/// the closure returns and the connection is dropped.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    busy_timeout: Duration,
}

impl Database {
    /// Open (or create) a database at the given path and run all pending
    /// migrations.
    ///
    /// Fails if the file cannot be opened at all. This is the only storage
    /// error the service treats as fatal.
    pub fn new(path: &Path) -> Result<Self, LedcamError> {
        Self::with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Same as [`Database::new`] with an explicit lock wait.
    pub fn with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, LedcamError> {
        // Ensure parent directory exists.
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Self {
            path: path.to_path_buf(),
            busy_timeout,
        };

        db.with_conn(migrations::run_migrations)?;
        info!("Database opened at {}", path.display());

        Ok(db)
    }

    /// Path of the backing SQLite file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Execute a closure against a freshly opened connection.
    ///
    /// The connection is closed when the closure returns.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedcamError>
    where
        F: FnOnce(&Connection) -> Result<T, LedcamError>,
    {
        let conn = self.open()?;
        let result = f(&conn);
        if let Err((_, e)) = conn.close() {
            debug!(error = %e, "Closing connection failed");
        }
        result
    }

    fn open(&self) -> Result<Connection, LedcamError> {
        let conn = Connection::open(&self.path)
            .map_err(|e| LedcamError::Storage(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| LedcamError::Storage(format!("Failed to set busy timeout: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| LedcamError::Storage(format!("Failed to set pragmas: {}", e)))?;

        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("photos.sqlite");
        let db = Database::new(&path).unwrap();

        db.with_conn(|conn| {
            let count: i64 = conn
                .query_row("SELECT COUNT(*) FROM photos", [], |row| row.get(0))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;
            assert_eq!(count, 0);
            Ok(())
        })
        .unwrap();

        assert!(path.exists());
        assert_eq!(db.path(), path.as_path());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("photos.sqlite")).unwrap();
        db.with_conn(|conn| {
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;
            assert_eq!(mode, "wal");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_writes_visible_to_next_connection() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("photos.sqlite")).unwrap();

        db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_number, led_serial, date) VALUES (1, 2, 'today')",
                [],
            )
            .map_err(|e| LedcamError::Storage(e.to_string()))?;
            Ok(())
        })
        .unwrap();

        // A separate handle on the same file sees the committed row.
        let other = Database::new(db.path()).unwrap();
        let count: i64 = other
            .with_conn(|conn| {
                conn.query_row("SELECT COUNT(*) FROM runs", [], |row| row.get(0))
                    .map_err(|e| LedcamError::Storage(e.to_string()))
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_unopenable_path_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be opened as a database file.
        let err = Database::new(dir.path()).unwrap_err();
        assert!(matches!(err, LedcamError::Storage(_)));
    }
}
