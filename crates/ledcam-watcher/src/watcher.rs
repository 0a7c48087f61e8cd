//! Polling directory watcher.
//!
//! Each cycle rebuilds the set of known metadata paths from the store,
//! lists every run's `photos/` and `run_info/` directories, and ingests the
//! files the store does not account for yet. Nothing is cached between
//! cycles: a file that failed to load stays unknown and is picked up again.
//!
//! Filesystem and store work runs on the blocking pool.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ledcam_core::config::LedcamConfig;
use ledcam_core::error::{LedcamError, Result};
use ledcam_core::types::{MetadataKind, PhotoRecord, RunRecord};
use ledcam_storage::MetadataRepository;

use crate::loader::{LoadOutcome, MetadataLoader};

const PHOTOS_DIR: &str = "photos";
const RUN_INFO_DIR: &str = "run_info";

/// Decide which store operation a metadata file belongs to.
///
/// Anything below a `run_info` directory is a run file. Otherwise a file
/// whose parent directory is a `photos` directory is a photo file. Any other
/// path returns `None` and is left alone.
pub fn classify(path: &Path) -> Option<MetadataKind> {
    let parent = path.parent()?;

    if parent.components().any(|c| c.as_os_str() == RUN_INFO_DIR) {
        return Some(MetadataKind::Run);
    }

    let parent_name = parent.file_name()?.to_string_lossy();
    if parent_name.contains(PHOTOS_DIR) {
        return Some(MetadataKind::Photo);
    }

    None
}

/// Counters for one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Files not yet known to the store.
    pub discovered: usize,
    pub photos_inserted: usize,
    pub runs_inserted: usize,
    /// Parsed and valid, but the key was already present.
    pub duplicates: usize,
    /// Valid, but the key belongs to a record ingested from another file.
    /// Such files never become known and are re-read every cycle.
    pub conflicts: usize,
    /// Empty or unreadable files left for a later cycle.
    pub deferred: usize,
    /// Files rejected for missing or malformed fields, or store errors.
    pub failed: usize,
}

impl CycleReport {
    pub fn inserted(&self) -> usize {
        self.photos_inserted + self.runs_inserted
    }
}

enum FileOutcome {
    Inserted(MetadataKind),
    Duplicate,
    Conflict,
    Deferred,
    Failed,
}

/// Discovers new metadata files and feeds them into the store.
pub struct DirectoryWatcher {
    repo: Arc<MetadataRepository>,
    loader: MetadataLoader,
    /// Explicit run directories. `None` means every run in the store.
    run_dirs: Option<Vec<PathBuf>>,
    poll_interval: Duration,
    extension: String,
    cancel: CancellationToken,
    /// Conflicting files already reported at warn level.
    reported_conflicts: Mutex<HashSet<PathBuf>>,
}

impl DirectoryWatcher {
    /// Watcher over every run directory recorded in the store.
    pub fn new(repo: Arc<MetadataRepository>, loader: MetadataLoader, cancel: CancellationToken) -> Self {
        let extension = repo.metadata_extension().to_string();
        Self {
            repo,
            loader: loader.with_cancellation(cancel.clone()),
            run_dirs: None,
            poll_interval: Duration::from_secs(5),
            extension,
            cancel,
            reported_conflicts: Mutex::new(HashSet::new()),
        }
    }

    /// Build a watcher from the `[watcher]` and `[loader]` config sections.
    pub fn from_config(
        repo: Arc<MetadataRepository>,
        config: &LedcamConfig,
        cancel: CancellationToken,
    ) -> Self {
        let watcher = Self::new(repo, MetadataLoader::from_config(&config.loader), cancel)
            .with_poll_interval(config.watcher.poll_interval());
        if config.watcher.run_dirs.is_empty() {
            watcher
        } else {
            watcher.with_run_dirs(config.watcher.run_dirs.clone())
        }
    }

    /// Watch these run directories instead of the ones recorded in the store.
    pub fn with_run_dirs(mut self, run_dirs: Vec<PathBuf>) -> Self {
        self.run_dirs = Some(run_dirs);
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Ask the poll loop to exit at its next safe point.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run directories to scan this cycle.
    pub fn watch_targets(&self) -> Result<Vec<PathBuf>> {
        resolve_targets(&self.repo, self.run_dirs.as_deref())
    }

    /// Metadata files under the targets that the store does not know yet.
    ///
    /// Missing or empty directories are logged and skipped.
    pub fn scan(&self, targets: &[PathBuf], known: &HashSet<PathBuf>) -> BTreeSet<PathBuf> {
        scan_targets(targets, known, &self.extension)
    }

    /// Run one scan-classify-ingest cycle.
    ///
    /// Per-file failures are logged and counted; only a store failure while
    /// building the known set aborts the cycle.
    pub async fn poll_once(&self) -> Result<CycleReport> {
        let repo = Arc::clone(&self.repo);
        let run_dirs = self.run_dirs.clone();
        let extension = self.extension.clone();
        let incoming = tokio::task::spawn_blocking(move || -> Result<BTreeSet<PathBuf>> {
            let known = repo.known_metadata_paths()?;
            let targets = resolve_targets(&repo, run_dirs.as_deref())?;
            Ok(scan_targets(&targets, &known, &extension))
        })
        .await
        .map_err(|e| LedcamError::Storage(format!("Scan task panicked: {}", e)))??;

        let mut report = CycleReport {
            discovered: incoming.len(),
            ..CycleReport::default()
        };

        // Runs first so a photo's run usually exists by the time it lands.
        // `scan` only lists run_info/ and photos/, so every path classifies.
        let (runs, photos): (Vec<_>, Vec<_>) = incoming
            .into_iter()
            .filter_map(|path| classify(&path).map(|kind| (path, kind)))
            .partition(|(_, kind)| *kind == MetadataKind::Run);

        for (path, kind) in runs.into_iter().chain(photos) {
            if self.cancel.is_cancelled() {
                info!("Stop requested, leaving remaining files for next start");
                break;
            }
            match self.ingest(&path, kind).await {
                FileOutcome::Inserted(MetadataKind::Photo) => report.photos_inserted += 1,
                FileOutcome::Inserted(MetadataKind::Run) => report.runs_inserted += 1,
                FileOutcome::Duplicate => report.duplicates += 1,
                FileOutcome::Conflict => report.conflicts += 1,
                FileOutcome::Deferred => report.deferred += 1,
                FileOutcome::Failed => report.failed += 1,
            }
        }

        Ok(report)
    }

    async fn ingest(&self, path: &Path, kind: MetadataKind) -> FileOutcome {
        let doc = match self.loader.load(path).await {
            LoadOutcome::Loaded(doc) => doc,
            LoadOutcome::Empty | LoadOutcome::Unavailable => return FileOutcome::Deferred,
        };

        let repo = Arc::clone(&self.repo);
        let owned = path.to_path_buf();
        let stored = tokio::task::spawn_blocking(move || store(&repo, &owned, &doc, kind))
            .await
            .map_err(|e| LedcamError::Storage(format!("Insert task panicked: {}", e)))
            .and_then(|r| r);

        match stored {
            Ok(Stored::Inserted) => {
                info!(path = %path.display(), kind = ?kind, "Ingested metadata file");
                FileOutcome::Inserted(kind)
            }
            Ok(Stored::Duplicate) => {
                debug!(path = %path.display(), kind = ?kind, "Record already present");
                FileOutcome::Duplicate
            }
            Ok(Stored::Conflict { existing }) => {
                let first = self
                    .reported_conflicts
                    .lock()
                    .map(|mut seen| seen.insert(path.to_path_buf()))
                    .unwrap_or(true);
                if first {
                    warn!(
                        path = %path.display(),
                        kind = ?kind,
                        existing = %existing,
                        "Record key already ingested from another file, this file will not be stored"
                    );
                } else {
                    debug!(path = %path.display(), kind = ?kind, "Record key belongs to another file");
                }
                FileOutcome::Conflict
            }
            Err(e) => {
                warn!(path = %path.display(), kind = ?kind, error = %e, "Failed to ingest metadata file");
                FileOutcome::Failed
            }
        }
    }

    /// Poll until stopped.
    ///
    /// Cancellation is honoured between cycles and between files, never in
    /// the middle of an insert.
    pub async fn run(&self) {
        match self.watch_targets() {
            Ok(targets) => {
                info!(
                    count = targets.len(),
                    self_discovering = self.run_dirs.is_none(),
                    "Looking for new photo and run files"
                );
                for dir in &targets {
                    info!(photos = %dir.join(PHOTOS_DIR).display(), run_info = %dir.join(RUN_INFO_DIR).display(), "Watching");
                }
            }
            Err(e) => warn!(error = %e, "Unable to resolve watch targets"),
        }

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.poll_once().await {
                Ok(report) if report.discovered > 0 => info!(?report, "Poll cycle complete"),
                Ok(report) => debug!(?report, "Poll cycle complete"),
                Err(e) => warn!(error = %e, "Poll cycle failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        info!("Watcher stopped fetching");
    }
}

/// What an insert attempt did.
enum Stored {
    Inserted,
    Duplicate,
    /// The key exists and was ingested from `existing`.
    Conflict { existing: String },
}

/// Build the record for `path` and insert it.
///
/// A rejected insert is a plain duplicate when the stored row records `path`
/// as its source, and a conflict when it belongs to a different file.
fn store(repo: &MetadataRepository, path: &Path, doc: &Value, kind: MetadataKind) -> Result<Stored> {
    let source = path.to_string_lossy();
    match kind {
        MetadataKind::Photo => {
            let photo = PhotoRecord::from_metadata(doc, Some(path))?;
            if repo.insert_photo(&photo)? {
                return Ok(Stored::Inserted);
            }
            // A same-directory row with no source was just given this path.
            match repo.find_photo(&photo.photo_arw)? {
                Some(existing) => match existing.metadata_path {
                    Some(recorded) if recorded == source => Ok(Stored::Duplicate),
                    Some(recorded) => Ok(Stored::Conflict { existing: recorded }),
                    None => Ok(Stored::Conflict {
                        existing: existing.photo_directory,
                    }),
                },
                None => Ok(Stored::Duplicate),
            }
        }
        MetadataKind::Run => {
            let run = RunRecord::from_metadata(doc, Some(path))?;
            if repo.insert_run(&run)? {
                return Ok(Stored::Inserted);
            }
            match repo.find_run(run.run_number)?.and_then(|existing| existing.metadata_path) {
                Some(existing) if existing != source => Ok(Stored::Conflict { existing }),
                _ => Ok(Stored::Duplicate),
            }
        }
    }
}

fn resolve_targets(repo: &MetadataRepository, run_dirs: Option<&[PathBuf]>) -> Result<Vec<PathBuf>> {
    match run_dirs {
        Some(dirs) => Ok(dirs.to_vec()),
        None => repo.run_directories(),
    }
}

fn scan_targets(targets: &[PathBuf], known: &HashSet<PathBuf>, extension: &str) -> BTreeSet<PathBuf> {
    let mut incoming = BTreeSet::new();

    for run_dir in targets {
        for sub in [PHOTOS_DIR, RUN_INFO_DIR] {
            let dir = run_dir.join(sub);
            let files = list_metadata_files(&dir, extension);
            if files.is_empty() {
                debug!(dir = %dir.display(), "No metadata files");
            }
            incoming.extend(files.into_iter().filter(|f| !known.contains(f)));
        }
    }

    incoming
}

fn list_metadata_files(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Directory does not exist yet");
            return Vec::new();
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Unable to list directory");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "Unreadable directory entry");
                None
            }
        })
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext.to_string_lossy() == extension))
        .collect()
}
