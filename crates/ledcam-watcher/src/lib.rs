//! ledcam watcher crate - discovers and ingests new metadata files.
//!
//! The [`DirectoryWatcher`] polls each run's `photos/` and `run_info/`
//! directories, diffs the listing against what the store already holds, and
//! drives new files through the [`MetadataLoader`] into the store. A
//! [`ShutdownController`] stops the loop between files or cycles.

pub mod loader;
pub mod shutdown;
pub mod watcher;

pub use loader::{LoadOutcome, MetadataLoader};
pub use shutdown::ShutdownController;
pub use watcher::{classify, CycleReport, DirectoryWatcher};
