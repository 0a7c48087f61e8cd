//! Database schema migrations.
//!
//! v1 creates the `photos` and `runs` tables. v2 records the path of the
//! metadata file each row was ingested from.

use rusqlite::Connection;
use tracing::info;

use ledcam_core::error::LedcamError;

/// Run all pending database migrations.
///
/// Safe to call on every startup: applied versions are tracked in
/// `schema_migrations` and table creation never touches existing rows.
pub fn run_migrations(conn: &Connection) -> Result<(), LedcamError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| LedcamError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| LedcamError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: initial_schema");
    }

    if current_version < 2 {
        apply_v2(conn)?;
        info!("Applied migration v2: metadata_paths");
    }

    Ok(())
}

/// Version 1: photo and run tables.
fn apply_v1(conn: &Connection) -> Result<(), LedcamError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS photos (
            run_number       INTEGER,
            led_serial       INTEGER,
            date             TEXT,
            photo_directory  TEXT,
            photo_arw        TEXT PRIMARY KEY,
            photo_jpg        TEXT,
            channel          INTEGER,
            distance         REAL,
            voltage          REAL,
            iso              INTEGER,
            shutterspeed     REAL,
            best_x0          REAL,
            best_y0          REAL,
            best_R           REAL
        );

        CREATE INDEX IF NOT EXISTS idx_photos_run
            ON photos (run_number, led_serial);

        CREATE TABLE IF NOT EXISTS runs (
            run_number         INTEGER PRIMARY KEY,
            led_serial         INTEGER,
            date               TEXT,
            data_path          TEXT,
            channels           TEXT,
            distances          TEXT,
            photos_per_channel INTEGER,
            prefix             TEXT,
            photos             TEXT
        );

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'initial_schema');
        ",
    )
    .map_err(|e| LedcamError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}

/// Version 2: source metadata path on both tables.
///
/// Rows written before this version keep a NULL path until the same key is
/// ingested again. Photo rows are also matched by their image filename.
fn apply_v2(conn: &Connection) -> Result<(), LedcamError> {
    conn.execute_batch(
        "
        ALTER TABLE photos ADD COLUMN metadata_path TEXT;
        ALTER TABLE runs ADD COLUMN metadata_path TEXT;

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (2, 'metadata_paths');
        ",
    )
    .map_err(|e| LedcamError::Storage(format!("Failed to apply migration v2: {}", e)))?;

    Ok(())
}
