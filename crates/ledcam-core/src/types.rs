use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{LedcamError, Result};

// =============================================================================
// Enums
// =============================================================================

/// Tables a caller may read in bulk.
///
/// Every bulk read resolves its table through this enum, so no caller-supplied
/// string ever reaches the SQL text.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Photos,
    Runs,
}

impl Table {
    pub const ALL: [Table; 2] = [Table::Photos, Table::Runs];

    /// SQL identifier of the table.
    pub fn name(&self) -> &'static str {
        match self {
            Table::Photos => "photos",
            Table::Runs => "runs",
        }
    }

    /// Resolve a table name against the allow-list.
    pub fn from_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.name() == name)
    }
}

/// Role of a metadata file, decided by the directory it lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataKind {
    /// Lives in a run's `photos/` directory.
    Photo,
    /// Lives in a run's `run_info/` directory.
    Run,
}

// =============================================================================
// Records
// =============================================================================

/// One captured image and its acquisition context.
///
/// `photo_arw` (the primary image filename) is the natural key. The
/// `best_*` geometry fields are filled in by downstream circle fitting and
/// may be null at ingestion time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhotoRecord {
    pub run_number: i64,
    pub led_serial: i64,
    pub date: String,
    pub photo_directory: String,
    pub photo_arw: String,
    pub photo_jpg: String,
    pub channel: Option<i64>,
    pub distance: Option<f64>,
    pub voltage: Option<f64>,
    pub iso: i64,
    pub shutterspeed: f64,
    pub best_x0: Option<f64>,
    pub best_y0: Option<f64>,
    #[serde(rename = "best_R")]
    pub best_r: Option<f64>,
    /// Metadata file this record was ingested from, when known.
    pub metadata_path: Option<String>,
}

impl PhotoRecord {
    /// Build a record from a parsed photo metadata document.
    ///
    /// `photo_path` must hold the primary and secondary image paths; the
    /// directory of the primary image becomes `photo_directory`. Every
    /// required key must be present, although the geometry keys may carry
    /// `null`.
    pub fn from_metadata(doc: &Value, metadata_path: Option<&Path>) -> Result<Self> {
        let obj = as_object(doc)?;

        let (photo_directory, photo_arw, photo_jpg) = split_photo_path(required(obj, "photo_path")?)?;

        Ok(Self {
            run_number: int(obj, "run_number")?,
            led_serial: int(obj, "led_serial")?,
            date: text(obj, "date")?,
            photo_directory,
            photo_arw,
            photo_jpg,
            channel: optional_int(obj, "channel")?,
            distance: optional_real(obj, "distance")?,
            voltage: optional_real(obj, "voltage")?,
            iso: int(obj, "iso")?,
            shutterspeed: real(obj, "shutterspeed")?,
            best_x0: nullable_real(obj, "best_x0")?,
            best_y0: nullable_real(obj, "best_y0")?,
            best_r: nullable_real(obj, "best_R")?,
            metadata_path: metadata_path.map(|p| p.to_string_lossy().into_owned()),
        })
    }
}

/// One acquisition session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_number: i64,
    pub led_serial: i64,
    pub date: String,
    /// Root directory holding the run's `photos/` and `run_info/` folders.
    pub data_path: String,
    pub channels: Vec<i64>,
    pub distances: Vec<f64>,
    pub photos_per_channel: i64,
    pub prefix: String,
    /// Photo manifest as produced by the camera controller. Opaque here.
    pub photos: Value,
    pub metadata_path: Option<String>,
}

impl RunRecord {
    /// Build a record from a parsed run metadata document.
    pub fn from_metadata(doc: &Value, metadata_path: Option<&Path>) -> Result<Self> {
        let obj = as_object(doc)?;

        let channels = list(obj, "channels")?
            .iter()
            .map(|v| to_int("channels", v))
            .collect::<Result<Vec<_>>>()?;
        let distances = list(obj, "distances")?
            .iter()
            .map(|v| to_real("distances", v))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            run_number: int(obj, "run_number")?,
            led_serial: int(obj, "led_serial")?,
            date: text(obj, "date")?,
            data_path: text(obj, "data_path")?,
            channels,
            distances,
            photos_per_channel: int(obj, "photos_per_channel")?,
            prefix: text(obj, "prefix")?,
            photos: required(obj, "photos")?.clone(),
            metadata_path: metadata_path.map(|p| p.to_string_lossy().into_owned()),
        })
    }
}

// =============================================================================
// Field extraction
// =============================================================================

fn as_object(doc: &Value) -> Result<&Map<String, Value>> {
    doc.as_object()
        .ok_or_else(|| LedcamError::invalid("<root>", "metadata document is not a JSON object"))
}

fn required<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    obj.get(key).ok_or_else(|| LedcamError::missing(key))
}

fn int(obj: &Map<String, Value>, key: &str) -> Result<i64> {
    to_int(key, required(obj, key)?)
}

fn real(obj: &Map<String, Value>, key: &str) -> Result<f64> {
    to_real(key, required(obj, key)?)
}

fn text(obj: &Map<String, Value>, key: &str) -> Result<String> {
    match required(obj, key)? {
        Value::String(s) => Ok(s.clone()),
        Value::Null => Err(LedcamError::invalid(key, "expected text, got null")),
        other => Ok(other.to_string()),
    }
}

fn list<'a>(obj: &'a Map<String, Value>, key: &str) -> Result<&'a Vec<Value>> {
    required(obj, key)?
        .as_array()
        .ok_or_else(|| LedcamError::invalid(key, "expected a list"))
}

/// Required key whose value may be `null`.
fn nullable_real(obj: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match required(obj, key)? {
        Value::Null => Ok(None),
        v => to_real(key, v).map(Some),
    }
}

fn optional_int(obj: &Map<String, Value>, key: &str) -> Result<Option<i64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => to_int(key, v).map(Some),
    }
}

fn optional_real(obj: &Map<String, Value>, key: &str) -> Result<Option<f64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => to_real(key, v).map(Some),
    }
}

fn to_int(key: &str, value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| is_integral_i64(*f)).map(|f| f as i64))
            .ok_or_else(|| LedcamError::invalid(key, format!("expected integer, got {}", n))),
        // The controller writes some identifiers as strings ("9998").
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| LedcamError::invalid(key, format!("expected integer, got {:?}", s))),
        other => Err(LedcamError::invalid(key, format!("expected integer, got {}", other))),
    }
}

/// Whole float that fits in an `i64` without saturating.
fn is_integral_i64(f: f64) -> bool {
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range.
    f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64
}

fn to_real(key: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| LedcamError::invalid(key, format!("expected number, got {}", n))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| LedcamError::invalid(key, format!("expected number, got {:?}", s))),
        other => Err(LedcamError::invalid(key, format!("expected number, got {}", other))),
    }
}

/// Split `photo_path` into (directory of primary, primary filename, secondary filename).
fn split_photo_path(value: &Value) -> Result<(String, String, String)> {
    let paths = value
        .as_array()
        .ok_or_else(|| LedcamError::invalid("photo_path", "expected a list of two paths"))?;
    if paths.len() < 2 {
        return Err(LedcamError::invalid(
            "photo_path",
            format!("expected two paths, got {}", paths.len()),
        ));
    }

    let primary = paths[0]
        .as_str()
        .map(Path::new)
        .ok_or_else(|| LedcamError::invalid("photo_path", "primary path is not text"))?;
    let secondary = paths[1]
        .as_str()
        .map(Path::new)
        .ok_or_else(|| LedcamError::invalid("photo_path", "secondary path is not text"))?;

    let file_name = |p: &Path| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LedcamError::invalid("photo_path", format!("no file name in {}", p.display())))
    };

    let directory = primary
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok((directory, file_name(primary)?, file_name(secondary)?))
}
