use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Where a chunk came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// Vault-relative note path, or the vector store's source field
    pub path: String,
    /// Character offset of the chunk inside its document
    pub offset: usize,
    pub chunk_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub text: String,
    pub source: SourceMetadata,
}

impl Chunk {
    pub fn new(text: String, source: SourceMetadata) -> Self {
        // Identity comes from content only, never from position
        let id = Self::content_id(&text);

        Self { id, text, source }
    }

    /// Stable content hash of a chunk's text.
    pub fn content_id(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.trim().as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }

    pub fn file_name(&self) -> &str {
        self.source
            .path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.source.path)
    }
}
