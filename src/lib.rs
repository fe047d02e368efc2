//! # Haystack - searchable mirror of git repositories
//!
//! Haystack clones repositories, records the files of their head commit in
//! SQLite and answers substring queries over everything it has indexed.
//!
//! Haystack provides:
//! - Incremental ingestion keyed on the head commit of each repository
//! - Atomic replacement of a repository's indexed contents
//! - A pooled SQLite store (file-backed or shared in-memory)
//! - Case-insensitive content search across all repositories

pub mod config;
pub mod git;
pub mod output;
pub mod pile;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use git::{GitBackend, GitCli};
pub use pile::{IngestOutcome, Pile, PileOptions};
pub use storage::{PileStats, Repository, SearchHit};
pub use tokio_util::sync::CancellationToken;

use std::path::PathBuf;

/// Result type alias for Haystack operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Haystack operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid repository URL: {0:?}")]
    InvalidUrl(String),

    #[error("Clone failed for {url}: {message}")]
    Clone { url: String, message: String },

    #[error("Could not read latest commit: {0}")]
    Commit(String),

    #[error("Could not list files: {0}")]
    ListFiles(String),

    #[error("Failed to read {}: {source}", .path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to store {path}: {source}")]
    InsertContent {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Ingestion cancelled")]
    Cancelled,

    #[error("Ingestion already in progress for {0}")]
    IngestInProgress(String),
}
