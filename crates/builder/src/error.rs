use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is unreadable: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("no valid checkpoint in {dir}: all {tried} candidates were unreadable")]
    NoValidCheckpoint { dir: PathBuf, tried: usize },

    #[error("no graph artifact or checkpoint found in {0}")]
    NotFound(PathBuf),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Conditions that stop a build. Per-chunk failures never end up here.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("no chunks available to build from")]
    NoChunks,

    #[error("cannot persist build progress: {0}")]
    Checkpoint(#[from] CheckpointError),
}
