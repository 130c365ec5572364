//! Error types shared by the correction and partition pipelines.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Per-file failure. None of these abort a batch; they are recorded against the file.
#[derive(Debug, Error)]
pub enum TileError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt tile {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("cannot derive tile coordinates from '{name}': {reason}")]
    TileName { name: String, reason: String },
}

impl TileError {
    /// Classify an I/O error raised while reading or writing `path`.
    ///
    /// Malformed content (`InvalidData`, `UnexpectedEof`) is a corrupt tile, anything
    /// else is an I/O failure.
    pub fn from_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => TileError::Corrupt {
                path,
                reason: source.to_string(),
            },
            _ => TileError::Io { path, source },
        }
    }

    /// Short machine-friendly class name, used in batch summaries.
    pub fn kind(&self) -> &'static str {
        match self {
            TileError::Io { .. } => "io",
            TileError::Corrupt { .. } => "corrupt",
            TileError::TileName { .. } => "tile-name",
        }
    }
}

/// Failures that stop a whole batch before any file is processed.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("cannot scan {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot create output directory {path}: {source}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Errors while loading a [`crate::config::BatchConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
