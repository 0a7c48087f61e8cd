//! Idempotent reads and writes over the `photos` and `runs` tables.
//!
//! Inserts use `INSERT OR IGNORE`, so re-ingesting a photo (by primary image
//! filename) or a run (by run number) leaves the existing row untouched.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::ToSql;
use rusqlite::{OptionalExtension, Row};
use serde_json::Value;
use tracing::{debug, warn};

use ledcam_core::error::LedcamError;
use ledcam_core::types::{PhotoRecord, RunRecord, Table};

use crate::db::Database;

const PHOTO_COLUMNS: &str = "run_number, led_serial, date, photo_directory, photo_arw, photo_jpg,
     channel, distance, voltage, iso, shutterspeed, best_x0, best_y0, best_R, metadata_path";

const RUN_COLUMNS: &str = "run_number, led_serial, date, data_path, channels, distances,
     photos_per_channel, prefix, photos, metadata_path";

/// Result of a bulk table read.
#[derive(Debug, Clone, PartialEq)]
pub enum TableRows {
    Photos(Vec<PhotoRecord>),
    Runs(Vec<RunRecord>),
    /// The requested table is not on the allow-list; nothing was queried.
    Denied,
}

impl TableRows {
    pub fn len(&self) -> usize {
        match self {
            TableRows::Photos(rows) => rows.len(),
            TableRows::Runs(rows) => rows.len(),
            TableRows::Denied => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Optional filters for [`MetadataRepository::fetch_photo_paths`].
///
/// Unset fields match any value; set fields are combined with AND.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotoFilter {
    pub run_number: Option<i64>,
    pub led_serial: Option<i64>,
    pub channel: Option<i64>,
    pub distance: Option<f64>,
}

impl PhotoFilter {
    pub fn run_number(mut self, run_number: i64) -> Self {
        self.run_number = Some(run_number);
        self
    }

    pub fn led_serial(mut self, led_serial: i64) -> Self {
        self.led_serial = Some(led_serial);
        self
    }

    pub fn channel(mut self, channel: i64) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn distance(mut self, distance: f64) -> Self {
        self.distance = Some(distance);
        self
    }

    fn where_clause(&self) -> (String, Vec<Box<dyn ToSql>>) {
        let mut conditions: Vec<&str> = Vec::new();
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(v) = self.run_number {
            conditions.push("run_number = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = self.led_serial {
            conditions.push("led_serial = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = self.channel {
            conditions.push("channel = ?");
            params.push(Box::new(v));
        }
        if let Some(v) = self.distance {
            conditions.push("distance = ?");
            params.push(Box::new(v));
        }

        if conditions.is_empty() {
            (String::new(), params)
        } else {
            (format!(" WHERE {}", conditions.join(" AND ")), params)
        }
    }
}

/// Derive the metadata file path for a stored photo: the primary image path
/// with its extension swapped for `extension`.
///
/// Returns `None` when the filename has no usable stem.
pub fn derive_metadata_path(directory: &str, photo_arw: &str, extension: &str) -> Option<PathBuf> {
    let name = Path::new(photo_arw);
    if photo_arw.is_empty() || name.file_stem().is_none() || name.file_name().is_none() {
        return None;
    }
    Some(Path::new(directory).join(name).with_extension(extension))
}

/// Store operations for photo and run metadata.
pub struct MetadataRepository {
    db: Arc<Database>,
    metadata_extension: String,
}

impl MetadataRepository {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            metadata_extension: "json".to_string(),
        }
    }

    /// Use a different metadata extension when deriving paths from image names.
    pub fn with_metadata_extension(mut self, extension: impl Into<String>) -> Self {
        self.metadata_extension = extension.into();
        self
    }

    pub fn metadata_extension(&self) -> &str {
        &self.metadata_extension
    }

    /// Insert a photo unless one with the same `photo_arw` already exists.
    ///
    /// Returns `true` if a row was written. When the existing row sits in the
    /// same directory but has no recorded source file, the incoming
    /// `metadata_path` is recorded on it; nothing else is touched.
    pub fn insert_photo(&self, photo: &PhotoRecord) -> Result<bool, LedcamError> {
        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "INSERT OR IGNORE INTO photos ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                        PHOTO_COLUMNS
                    ),
                    rusqlite::params![
                        photo.run_number,
                        photo.led_serial,
                        photo.date,
                        photo.photo_directory,
                        photo.photo_arw,
                        photo.photo_jpg,
                        photo.channel,
                        photo.distance,
                        photo.voltage,
                        photo.iso,
                        photo.shutterspeed,
                        photo.best_x0,
                        photo.best_y0,
                        photo.best_r,
                        photo.metadata_path,
                    ],
                )
                .map_err(|e| LedcamError::Storage(format!("Failed to insert photo: {}", e)))?;
            if changed > 0 {
                return Ok(true);
            }

            if let Some(path) = &photo.metadata_path {
                let recorded = conn
                    .execute(
                        "UPDATE photos SET metadata_path = ?1
                         WHERE photo_arw = ?2 AND photo_directory = ?3 AND metadata_path IS NULL",
                        rusqlite::params![path, photo.photo_arw, photo.photo_directory],
                    )
                    .map_err(|e| LedcamError::Storage(format!("Failed to record photo source: {}", e)))?;
                if recorded > 0 {
                    debug!(photo_arw = %photo.photo_arw, path = %path, "Recorded source file on existing photo");
                }
            }
            Ok(false)
        })
    }

    /// Insert a run unless one with the same `run_number` already exists.
    ///
    /// List and manifest fields are stored as JSON text. An existing run with
    /// no recorded source file gets the incoming `metadata_path`, so its
    /// `run_info` file stops looking new.
    pub fn insert_run(&self, run: &RunRecord) -> Result<bool, LedcamError> {
        let channels = serde_json::to_string(&run.channels)?;
        let distances = serde_json::to_string(&run.distances)?;
        let photos = serde_json::to_string(&run.photos)?;

        self.db.with_conn(|conn| {
            let changed = conn
                .execute(
                    &format!(
                        "INSERT OR IGNORE INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                        RUN_COLUMNS
                    ),
                    rusqlite::params![
                        run.run_number,
                        run.led_serial,
                        run.date,
                        run.data_path,
                        channels,
                        distances,
                        run.photos_per_channel,
                        run.prefix,
                        photos,
                        run.metadata_path,
                    ],
                )
                .map_err(|e| LedcamError::Storage(format!("Failed to insert run: {}", e)))?;
            if changed > 0 {
                return Ok(true);
            }

            if let Some(path) = &run.metadata_path {
                let recorded = conn
                    .execute(
                        "UPDATE runs SET metadata_path = ?1 WHERE run_number = ?2 AND metadata_path IS NULL",
                        rusqlite::params![path, run.run_number],
                    )
                    .map_err(|e| LedcamError::Storage(format!("Failed to record run source: {}", e)))?;
                if recorded > 0 {
                    debug!(run_number = run.run_number, path = %path, "Recorded source file on existing run");
                }
            }
            Ok(false)
        })
    }

    /// Read every row of an allowed table.
    ///
    /// Names outside the allow-list return [`TableRows::Denied`] without
    /// touching the database.
    pub fn fetch_table(&self, table_name: &str) -> Result<TableRows, LedcamError> {
        match Table::from_name(table_name) {
            Some(Table::Photos) => Ok(TableRows::Photos(self.photos()?)),
            Some(Table::Runs) => Ok(TableRows::Runs(self.runs()?)),
            None => {
                warn!(table = %table_name, "Refusing to read table outside the allow-list");
                Ok(TableRows::Denied)
            }
        }
    }

    /// All photo rows.
    pub fn photos(&self) -> Result<Vec<PhotoRecord>, LedcamError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM photos", PHOTO_COLUMNS))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| Ok(row_to_photo(row)))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            let mut photos = Vec::new();
            for row in rows {
                let photo = row.map_err(|e| LedcamError::Storage(e.to_string()))??;
                photos.push(photo);
            }
            Ok(photos)
        })
    }

    /// All run rows, with list and manifest columns decoded.
    pub fn runs(&self) -> Result<Vec<RunRecord>, LedcamError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {} FROM runs ORDER BY run_number", RUN_COLUMNS))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            let rows = stmt
                .query_map([], |row| Ok(row_to_run(row)))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            let mut runs = Vec::new();
            for row in rows {
                let run = row.map_err(|e| LedcamError::Storage(e.to_string()))??;
                runs.push(run);
            }
            Ok(runs)
        })
    }

    /// Find a photo by its primary image filename.
    pub fn find_photo(&self, photo_arw: &str) -> Result<Option<PhotoRecord>, LedcamError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {} FROM photos WHERE photo_arw = ?1", PHOTO_COLUMNS),
                    rusqlite::params![photo_arw],
                    |row| Ok(row_to_photo(row)),
                )
                .optional()
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            result.transpose()
        })
    }

    /// Find a run by its number.
    pub fn find_run(&self, run_number: i64) -> Result<Option<RunRecord>, LedcamError> {
        self.db.with_conn(|conn| {
            let result = conn
                .query_row(
                    &format!("SELECT {} FROM runs WHERE run_number = ?1", RUN_COLUMNS),
                    rusqlite::params![run_number],
                    |row| Ok(row_to_run(row)),
                )
                .optional()
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            result.transpose()
        })
    }

    /// Count rows in an allowed table.
    pub fn count(&self, table: Table) -> Result<u64, LedcamError> {
        self.db.with_conn(|conn| {
            let sql = match table {
                Table::Photos => "SELECT COUNT(*) FROM photos",
                Table::Runs => "SELECT COUNT(*) FROM runs",
            };
            let count: i64 = conn
                .query_row(sql, [], |row| row.get(0))
                .map_err(|e| LedcamError::Storage(e.to_string()))?;
            Ok(count as u64)
        })
    }

    /// Metadata file paths of the photos matching every set filter.
    ///
    /// Rows whose path cannot be derived are logged and skipped.
    pub fn fetch_photo_paths(&self, filter: &PhotoFilter) -> Result<Vec<PathBuf>, LedcamError> {
        let (where_clause, params) = filter.where_clause();
        let sql = format!(
            "SELECT photo_directory, photo_arw FROM photos{} ORDER BY photo_arw",
            where_clause
        );

        let rows: Vec<(Option<String>, Option<String>)> = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&sql)
                .map_err(|e| LedcamError::Storage(format!("Photo path query prepare: {}", e)))?;

            let param_refs: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt
                .query_map(param_refs.as_slice(), |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(|e| LedcamError::Storage(format!("Photo path query: {}", e)))?;

            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| LedcamError::Storage(e.to_string()))
        })?;

        let mut paths = Vec::with_capacity(rows.len());
        for (directory, photo_arw) in rows {
            let derived = match (&directory, &photo_arw) {
                (Some(dir), Some(arw)) => derive_metadata_path(dir, arw, &self.metadata_extension),
                _ => None,
            };
            match derived {
                Some(path) => paths.push(path),
                None => warn!(
                    directory = ?directory,
                    photo_arw = ?photo_arw,
                    "Unable to derive metadata path for photo row, skipping"
                ),
            }
        }
        Ok(paths)
    }

    /// Every metadata path the store already accounts for.
    ///
    /// Includes the recorded source path of every photo and run, plus the
    /// path derived from each photo's image filename for rows that predate
    /// recorded paths or were written by another tool.
    pub fn known_metadata_paths(&self) -> Result<HashSet<PathBuf>, LedcamError> {
        let (photo_rows, run_paths) = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT photo_directory, photo_arw, metadata_path FROM photos")
                .map_err(|e| LedcamError::Storage(e.to_string()))?;
            let photo_rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                })
                .map_err(|e| LedcamError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            let mut stmt = conn
                .prepare("SELECT metadata_path FROM runs WHERE metadata_path IS NOT NULL")
                .map_err(|e| LedcamError::Storage(e.to_string()))?;
            let run_paths = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| LedcamError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            Ok((photo_rows, run_paths))
        })?;

        let mut known: HashSet<PathBuf> = run_paths.into_iter().map(PathBuf::from).collect();
        for (directory, photo_arw, metadata_path) in photo_rows {
            if let Some(path) = metadata_path {
                known.insert(PathBuf::from(path));
            }
            match (directory, photo_arw) {
                (Some(dir), Some(arw)) => {
                    match derive_metadata_path(&dir, &arw, &self.metadata_extension) {
                        Some(path) => {
                            known.insert(path);
                        }
                        None => debug!(directory = %dir, photo_arw = %arw, "No derivable metadata path"),
                    }
                }
                (dir, arw) => debug!(directory = ?dir, photo_arw = ?arw, "Incomplete photo row"),
            }
        }
        Ok(known)
    }

    /// Distinct root directories of every stored run.
    pub fn run_directories(&self) -> Result<Vec<PathBuf>, LedcamError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT data_path FROM runs
                     WHERE data_path IS NOT NULL AND data_path != ''
                     ORDER BY data_path",
                )
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            let dirs = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| LedcamError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| LedcamError::Storage(e.to_string()))?;

            Ok(dirs.into_iter().map(PathBuf::from).collect())
        })
    }
}

/// NULL in a non-optional column (rows written by other tools) reads back as
/// zero or empty text.
fn row_to_photo(row: &Row) -> Result<PhotoRecord, LedcamError> {
    let get_err = |e: rusqlite::Error| LedcamError::Storage(e.to_string());
    Ok(PhotoRecord {
        run_number: row.get::<_, Option<i64>>(0).map_err(get_err)?.unwrap_or_default(),
        led_serial: row.get::<_, Option<i64>>(1).map_err(get_err)?.unwrap_or_default(),
        date: row.get::<_, Option<String>>(2).map_err(get_err)?.unwrap_or_default(),
        photo_directory: row.get::<_, Option<String>>(3).map_err(get_err)?.unwrap_or_default(),
        photo_arw: row.get(4).map_err(get_err)?,
        photo_jpg: row.get::<_, Option<String>>(5).map_err(get_err)?.unwrap_or_default(),
        channel: row.get(6).map_err(get_err)?,
        distance: row.get(7).map_err(get_err)?,
        voltage: row.get(8).map_err(get_err)?,
        iso: row.get::<_, Option<i64>>(9).map_err(get_err)?.unwrap_or_default(),
        shutterspeed: row.get::<_, Option<f64>>(10).map_err(get_err)?.unwrap_or_default(),
        best_x0: row.get(11).map_err(get_err)?,
        best_y0: row.get(12).map_err(get_err)?,
        best_r: row.get(13).map_err(get_err)?,
        metadata_path: row.get(14).map_err(get_err)?,
    })
}

fn row_to_run(row: &Row) -> Result<RunRecord, LedcamError> {
    let get_err = |e: rusqlite::Error| LedcamError::Storage(e.to_string());

    let channels: Option<String> = row.get(4).map_err(get_err)?;
    let distances: Option<String> = row.get(5).map_err(get_err)?;
    let photos: Option<String> = row.get(8).map_err(get_err)?;

    Ok(RunRecord {
        run_number: row.get(0).map_err(get_err)?,
        led_serial: row.get::<_, Option<i64>>(1).map_err(get_err)?.unwrap_or_default(),
        date: row.get::<_, Option<String>>(2).map_err(get_err)?.unwrap_or_default(),
        data_path: row.get::<_, Option<String>>(3).map_err(get_err)?.unwrap_or_default(),
        channels: decode_or_default(channels.as_deref())?,
        distances: decode_or_default(distances.as_deref())?,
        photos_per_channel: row.get::<_, Option<i64>>(6).map_err(get_err)?.unwrap_or_default(),
        prefix: row.get::<_, Option<String>>(7).map_err(get_err)?.unwrap_or_default(),
        photos: match photos.as_deref() {
            Some(text) => serde_json::from_str(text)?,
            None => Value::Null,
        },
        metadata_path: row.get(9).map_err(get_err)?,
    })
}

fn decode_or_default<T>(text: Option<&str>) -> Result<Vec<T>, LedcamError>
where
    T: serde::de::DeserializeOwned,
{
    match text {
        Some(text) => Ok(serde_json::from_str(text)?),
        None => Ok(Vec::new()),
    }
}
