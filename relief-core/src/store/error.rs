use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("entity store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("failed to read seed file {path}: {reason}")]
    Seed { path: PathBuf, reason: String },
    #[error("durable store unavailable: {0}")]
    Unavailable(String),
    #[error("store invariant violated: {0}")]
    Invariant(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
