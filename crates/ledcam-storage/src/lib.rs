//! ledcam storage crate - SQLite persistence for photo and run metadata.
//!
//! Provides the schema migrations, a connection-per-operation `Database`
//! handle, and the idempotent `MetadataRepository` that the watcher and
//! downstream analysis read and write through.

pub mod db;
pub mod migrations;
pub mod repository;

pub use db::Database;
pub use repository::{derive_metadata_path, MetadataRepository, PhotoFilter, TableRows};
