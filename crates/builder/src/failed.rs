use chrono::{DateTime, Utc};
use ingest::Chunk;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::CheckpointError;
use crate::persist::{read_json, write_json_atomic};

pub const FAILED_CHUNKS_FILE: &str = "failed_chunks.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedChunk {
    pub chunk: Chunk,
    pub error: String,
    /// Provider calls across every pass that tried this chunk
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Chunks that exhausted their retries, kept with their text for a later pass.
#[derive(Debug)]
pub struct FailedChunkStore {
    path: PathBuf,
    chunks: BTreeMap<String, FailedChunk>,
}

impl FailedChunkStore {
    /// An empty record that will be written to `dir` on the next save.
    pub fn empty(dir: &Path) -> Self {
        Self {
            path: dir.join(FAILED_CHUNKS_FILE),
            chunks: BTreeMap::new(),
        }
    }

    /// Reads the record in `dir`; a missing file is an empty record.
    pub fn load(dir: &Path) -> Result<Self, CheckpointError> {
        let mut store = Self::empty(dir);
        if store.path.exists() {
            store.chunks = read_json(&store.path)?;
        }
        Ok(store)
    }

    pub fn save(&self) -> Result<(), CheckpointError> {
        write_json_atomic(&self.path, &self.chunks)
    }

    pub fn record(&mut self, chunk: &Chunk, error: &str, attempts: u32) {
        let previous = self.chunks.get(&chunk.id).map_or(0, |f| f.attempts);
        self.chunks.insert(
            chunk.id.clone(),
            FailedChunk {
                chunk: chunk.clone(),
                error: error.to_string(),
                attempts: previous + attempts,
                failed_at: Utc::now(),
            },
        );
    }

    pub fn remove(&mut self, chunk_id: &str) -> Option<FailedChunk> {
        self.chunks.remove(chunk_id)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.chunks.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &FailedChunk> {
        self.chunks.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest::SourceMetadata;
    use tempfile::TempDir;

    fn chunk(text: &str) -> Chunk {
        Chunk::new(
            text.into(),
            SourceMetadata {
                path: "a.md".into(),
                offset: 0,
                chunk_index: 0,
            },
        )
    }

    #[test]
    fn test_record_persists_and_accumulates_attempts() {
        let dir = TempDir::new().unwrap();
        let mut store = FailedChunkStore::load(dir.path()).unwrap();
        assert!(store.is_empty());

        let c = chunk("some text that failed");
        store.record(&c, "timeout", 3);
        store.record(&c, "rate limited", 2);
        store.save().unwrap();

        let reloaded = FailedChunkStore::load(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 1);
        let failed = reloaded.chunks().next().unwrap();
        assert_eq!(failed.attempts, 5);
        assert_eq!(failed.error, "rate limited");
        assert_eq!(failed.chunk.text, "some text that failed");
    }
}
