//! End-to-end ingestion tests.
//!
//! Each test lays out a run directory on disk, points a watcher at a fresh
//! SQLite file, and drives poll cycles against it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use ledcam_core::types::{RunRecord, Table};
use ledcam_storage::{Database, MetadataRepository, PhotoFilter, TableRows};
use ledcam_watcher::{DirectoryWatcher, MetadataLoader, ShutdownController};

// =============================================================================
// Helpers
// =============================================================================

struct Fixture {
    _dir: tempfile::TempDir,
    data_path: PathBuf,
    repo: Arc<MetadataRepository>,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let data_path = dir.path().join("run9998");
        std::fs::create_dir_all(data_path.join("photos")).unwrap();
        std::fs::create_dir_all(data_path.join("run_info")).unwrap();

        let db = Arc::new(Database::new(&dir.path().join("photos.sqlite")).unwrap());
        let repo = Arc::new(MetadataRepository::new(db));

        Self {
            _dir: dir,
            data_path,
            repo,
        }
    }

    fn watcher(&self) -> DirectoryWatcher {
        DirectoryWatcher::new(
            Arc::clone(&self.repo),
            MetadataLoader::new(2, Duration::from_millis(5)),
            CancellationToken::new(),
        )
        .with_run_dirs(vec![self.data_path.clone()])
    }

    fn photos_dir(&self) -> PathBuf {
        self.data_path.join("photos")
    }

    fn write_run_info(&self, run_number: i64) -> PathBuf {
        let path = self
            .data_path
            .join("run_info")
            .join(format!("run_info_{}.json", run_number));
        let doc = json!({
            "run_number": run_number,
            "led_serial": 1,
            "date": "2025-06-24",
            "data_path": self.data_path.to_string_lossy(),
            "channels": [1, 2],
            "distances": [10.0, 20.0],
            "photos_per_channel": 2,
            "prefix": format!("Run-{}", run_number),
            "photos": {"1": ["IMG001.ARW"]}
        });
        std::fs::write(&path, doc.to_string()).unwrap();
        path
    }

    fn write_photo(&self, stem: &str) -> PathBuf {
        self.write_photo_in(&self.photos_dir(), stem)
    }

    /// Photo metadata for `stem` in an arbitrary `photos/` directory.
    fn write_photo_in(&self, photos: &Path, stem: &str) -> PathBuf {
        std::fs::create_dir_all(photos).unwrap();
        let path = photos.join(format!("{}.json", stem));
        let doc = json!({
            "run_number": 9998,
            "led_serial": 1,
            "date": "2025-06-24-T161125",
            "photo_path": [
                photos.join(format!("{}.ARW", stem)).to_string_lossy(),
                photos.join(format!("{}.JPG", stem)).to_string_lossy(),
            ],
            "channel": 1,
            "distance": 10.0,
            "iso": 100,
            "shutterspeed": 0.004,
            "best_x0": null,
            "best_y0": null,
            "best_R": null
        });
        std::fs::write(&path, doc.to_string()).unwrap();
        path
    }

    fn counts(&self) -> (u64, u64) {
        (
            self.repo.count(Table::Runs).unwrap(),
            self.repo.count(Table::Photos).unwrap(),
        )
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_single_cycle_ingests_run_and_photo() {
    let fx = Fixture::new();
    fx.write_run_info(9998);
    fx.write_photo("IMG001");

    let report = fx.watcher().poll_once().await.unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.runs_inserted, 1);
    assert_eq!(report.photos_inserted, 1);

    let runs = match fx.repo.fetch_table("runs").unwrap() {
        TableRows::Runs(rows) => rows,
        other => panic!("expected runs, got {:?}", other),
    };
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_number, 9998);
    assert_eq!(runs[0].channels, vec![1, 2]);
    assert_eq!(runs[0].distances, vec![10.0, 20.0]);
    assert_eq!(runs[0].photos, json!({"1": ["IMG001.ARW"]}));

    let photos = match fx.repo.fetch_table("photos").unwrap() {
        TableRows::Photos(rows) => rows,
        other => panic!("expected photos, got {:?}", other),
    };
    assert_eq!(photos.len(), 1);
    assert_eq!(photos[0].photo_arw, "IMG001.ARW");
    assert_eq!(photos[0].photo_jpg, "IMG001.JPG");
    assert_eq!(photos[0].photo_directory, fx.photos_dir().to_string_lossy());
}

#[tokio::test]
async fn test_repeat_cycle_changes_nothing() {
    let fx = Fixture::new();
    fx.write_run_info(9998);
    fx.write_photo("IMG001");

    let watcher = fx.watcher();
    watcher.poll_once().await.unwrap();
    let before = fx.counts();

    let report = watcher.poll_once().await.unwrap();
    assert_eq!(report.discovered, 0);
    assert_eq!(fx.counts(), before);
    assert_eq!(before, (1, 1));
}

#[tokio::test]
async fn test_ingested_files_stay_known() {
    let fx = Fixture::new();
    fx.write_photo("IMG001");

    let watcher = fx.watcher();
    assert_eq!(watcher.poll_once().await.unwrap().photos_inserted, 1);

    fx.write_photo("IMG002");
    let report = watcher.poll_once().await.unwrap();
    assert_eq!(report.discovered, 1);
    assert_eq!(report.photos_inserted, 1);

    for _ in 0..3 {
        assert_eq!(watcher.poll_once().await.unwrap().discovered, 0);
    }
    assert_eq!(fx.counts(), (0, 2));
}

#[tokio::test]
async fn test_photo_with_unrelated_metadata_name_is_not_reingested() {
    let fx = Fixture::new();
    let path = fx.write_photo("IMG001");
    let renamed = fx.photos_dir().join("Run-9998_2025-06-24-T161125.json");
    std::fs::rename(&path, &renamed).unwrap();

    let watcher = fx.watcher();
    assert_eq!(watcher.poll_once().await.unwrap().photos_inserted, 1);
    assert_eq!(watcher.poll_once().await.unwrap().discovered, 0);
}

#[tokio::test]
async fn test_zero_byte_photo_is_deferred_and_retried() {
    let fx = Fixture::new();
    let empty = fx.photos_dir().join("IMG003.json");
    std::fs::write(&empty, "").unwrap();

    let watcher = fx.watcher();
    for _ in 0..2 {
        let report = watcher.poll_once().await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(fx.counts(), (0, 0));
    }

    // Once the producer finishes writing, the next cycle ingests it.
    fx.write_photo("IMG003");
    let report = watcher.poll_once().await.unwrap();
    assert_eq!(report.photos_inserted, 1);
}

#[tokio::test]
async fn test_malformed_file_does_not_stop_cycle() {
    let fx = Fixture::new();
    std::fs::write(fx.photos_dir().join("broken.json"), "{\"run_number\": ").unwrap();
    std::fs::write(fx.photos_dir().join("partial.json"), "{\"run_number\": 1}").unwrap();
    fx.write_photo("IMG001");

    let report = fx.watcher().poll_once().await.unwrap();
    assert_eq!(report.discovered, 3);
    assert_eq!(report.deferred, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.photos_inserted, 1);
}

#[tokio::test]
async fn test_legacy_run_row_file_becomes_known() {
    let fx = Fixture::new();
    // A run stored without a source file, as older stores and other tools leave it.
    fx.repo
        .insert_run(&RunRecord {
            run_number: 9998,
            led_serial: 1,
            date: "2025-06-24".to_string(),
            data_path: fx.data_path.to_string_lossy().into_owned(),
            channels: vec![1, 2],
            distances: vec![10.0, 20.0],
            photos_per_channel: 2,
            prefix: "Run-9998".to_string(),
            photos: json!({}),
            metadata_path: None,
        })
        .unwrap();
    let run_file = fx.write_run_info(9998);

    let watcher = fx.watcher();
    let report = watcher.poll_once().await.unwrap();
    assert_eq!(report.discovered, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.conflicts, 0);

    for _ in 0..2 {
        assert_eq!(watcher.poll_once().await.unwrap().discovered, 0);
    }
    let stored = fx.repo.find_run(9998).unwrap().unwrap();
    assert_eq!(stored.metadata_path, Some(run_file.to_string_lossy().into_owned()));
    // The original row is otherwise untouched.
    assert_eq!(stored.photos, json!({}));
    assert_eq!(fx.counts(), (1, 0));
}

#[tokio::test]
async fn test_photo_key_from_another_run_is_a_conflict() {
    let fx = Fixture::new();
    let other_run = fx._dir.path().join("run9999");
    fx.write_photo("IMG001");
    fx.write_photo_in(&other_run.join("photos"), "IMG001");

    let watcher = fx
        .watcher()
        .with_run_dirs(vec![fx.data_path.clone(), other_run.clone()]);

    let report = watcher.poll_once().await.unwrap();
    assert_eq!(report.discovered, 2);
    assert_eq!(report.photos_inserted, 1);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.duplicates, 0);

    // The losing file never lands and is seen again every cycle.
    for _ in 0..2 {
        let report = watcher.poll_once().await.unwrap();
        assert_eq!(report.discovered, 1);
        assert_eq!(report.conflicts, 1);
        assert_eq!(report.inserted(), 0);
    }
    assert_eq!(fx.counts(), (0, 1));
    let stored = fx.repo.find_photo("IMG001.ARW").unwrap().unwrap();
    assert_eq!(stored.photo_directory, fx.photos_dir().to_string_lossy());
}

#[tokio::test]
async fn test_files_outside_photos_and_run_info_are_ignored() {
    let fx = Fixture::new();
    let notes = fx.data_path.join("notes");
    std::fs::create_dir_all(&notes).unwrap();
    std::fs::write(notes.join("IMG001.json"), "{}").unwrap();
    std::fs::write(fx.data_path.join("summary.json"), "{}").unwrap();
    std::fs::create_dir_all(fx.photos_dir().join("thumbs")).unwrap();
    std::fs::write(fx.photos_dir().join("thumbs").join("IMG001.json"), "{}").unwrap();

    let watcher = fx.watcher();
    for _ in 0..2 {
        let report = watcher.poll_once().await.unwrap();
        assert_eq!(report.discovered, 0);
        assert_eq!(fx.counts(), (0, 0));
    }
}

#[tokio::test]
async fn test_self_discovers_run_directories_from_store() {
    let fx = Fixture::new();
    fx.write_run_info(9998);
    fx.write_photo("IMG001");

    // First pass with an explicit directory records the run.
    fx.watcher().poll_once().await.unwrap();

    fx.write_photo("IMG002");
    let discovering = DirectoryWatcher::new(
        Arc::clone(&fx.repo),
        MetadataLoader::new(1, Duration::from_millis(1)),
        CancellationToken::new(),
    );
    assert_eq!(discovering.watch_targets().unwrap(), vec![fx.data_path.clone()]);

    let report = discovering.poll_once().await.unwrap();
    assert_eq!(report.photos_inserted, 1);
    assert_eq!(fx.counts(), (1, 2));
}

#[tokio::test]
async fn test_missing_run_directory_is_not_fatal() {
    let fx = Fixture::new();
    fx.write_photo("IMG001");

    let watcher = fx
        .watcher()
        .with_run_dirs(vec![Path::new("/definitely/not/here").to_path_buf(), fx.data_path.clone()]);
    let report = watcher.poll_once().await.unwrap();
    assert_eq!(report.photos_inserted, 1);
}

#[tokio::test]
async fn test_fetch_photo_paths_after_ingest() {
    let fx = Fixture::new();
    fx.write_photo("IMG001");
    fx.write_photo("IMG002");
    fx.watcher().poll_once().await.unwrap();

    let paths = fx
        .repo
        .fetch_photo_paths(&PhotoFilter::default().run_number(9998).led_serial(1))
        .unwrap();
    assert_eq!(
        paths,
        vec![fx.photos_dir().join("IMG001.json"), fx.photos_dir().join("IMG002.json")]
    );
    for path in &paths {
        assert!(path.exists());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_run_loop_ingests_until_shutdown() {
    let fx = Fixture::new();
    fx.write_run_info(9998);
    fx.write_photo("IMG001");

    let shutdown = ShutdownController::new();
    let watcher = Arc::new(
        DirectoryWatcher::new(
            Arc::clone(&fx.repo),
            MetadataLoader::new(1, Duration::from_millis(1)),
            shutdown.token(),
        )
        .with_run_dirs(vec![fx.data_path.clone()])
        .with_poll_interval(Duration::from_millis(20)),
    );

    let running = Arc::clone(&watcher);
    let handle = tokio::spawn(async move { running.run().await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while fx.counts() != (1, 1) {
        assert!(tokio::time::Instant::now() < deadline, "watcher never ingested files");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    shutdown.trigger();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("Watcher should stop after shutdown")
        .unwrap();
    assert!(watcher.is_stopped());
    assert_eq!(fx.counts(), (1, 1));
}
