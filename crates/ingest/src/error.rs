use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("vault path does not exist: {0}")]
    VaultNotFound(PathBuf),

    #[error("vector store request failed: {0}")]
    VectorStore(String),

    #[error("embedding request failed: {0}")]
    Embedding(String),

    /// Fatal for a build: an empty graph must never be produced silently.
    #[error("no chunks available from {0}")]
    NoChunks(String),
}

impl From<reqwest::Error> for SourceError {
    fn from(err: reqwest::Error) -> Self {
        SourceError::VectorStore(err.to_string())
    }
}
