pub mod chunk;
pub mod chunker;
pub mod embeddings;
pub mod error;
pub mod reader;
pub mod vector_store;

pub use chunk::{Chunk, SourceMetadata};
pub use chunker::{Chunker, ChunkerConfig};
pub use embeddings::EmbeddingClient;
pub use error::SourceError;
pub use reader::VaultReader;
pub use vector_store::{Metadata, QdrantStore, SearchHit, StoredDocument, VectorStore};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Which backend feeds the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkSource {
    Vault,
    VectorStore,
    /// Vector store first, vault files when the store is unavailable or empty
    Auto,
}

impl FromStr for ChunkSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vault" => Ok(ChunkSource::Vault),
            "vectorstore" | "vector-store" | "qdrant" => Ok(ChunkSource::VectorStore),
            "auto" => Ok(ChunkSource::Auto),
            other => Err(format!("unknown chunk source: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub vault_path: Option<PathBuf>,
    pub qdrant_url: Option<String>,
    pub collection: String,
    pub embedding_url: String,
    pub embedding_model: String,
    pub chunk_max_size: usize,
    pub chunk_overlap: usize,
    pub min_document_len: usize,
    pub max_files: Option<usize>,
    /// Cap on the number of chunks handed to a build (test runs)
    pub limit: Option<usize>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            vault_path: None,
            qdrant_url: None,
            collection: "obsidian_vault".to_string(),
            embedding_url: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            chunk_max_size: 1000,
            chunk_overlap: 200,
            min_document_len: 100,
            max_files: None,
            limit: None,
        }
    }
}

impl SourceConfig {
    pub fn chunker(&self) -> Chunker {
        Chunker::new(ChunkerConfig {
            max_size: self.chunk_max_size,
            overlap: self.chunk_overlap,
            ..ChunkerConfig::default()
        })
    }

    pub fn qdrant_store(&self) -> Option<QdrantStore> {
        let url = self.qdrant_url.clone()?;
        let embeddings =
            EmbeddingClient::new(self.embedding_url.clone(), self.embedding_model.clone());
        Some(QdrantStore::new(url, self.collection.clone(), embeddings))
    }
}

/// Loads the chunk sequence for a build. Ordering is deterministic for a given source.
pub async fn load_chunks(
    source: ChunkSource,
    config: &SourceConfig,
) -> Result<Vec<Chunk>, SourceError> {
    let mut chunks = match source {
        ChunkSource::Vault => chunks_from_vault(config).await?,
        ChunkSource::VectorStore => {
            let store = config.qdrant_store().ok_or_else(|| {
                SourceError::NoChunks("vector store (no qdrant_url configured)".to_string())
            })?;
            chunks_from_store(&store).await?
        }
        ChunkSource::Auto => {
            let from_store = match config.qdrant_store() {
                Some(store) => match chunks_from_store(&store).await {
                    Ok(chunks) => chunks,
                    Err(e) => {
                        warn!(error = %e, "Vector store unavailable, falling back to vault files");
                        Vec::new()
                    }
                },
                None => Vec::new(),
            };

            if from_store.is_empty() && config.vault_path.is_some() {
                chunks_from_vault(config).await?
            } else {
                from_store
            }
        }
    };

    if let Some(limit) = config.limit {
        if chunks.len() > limit {
            info!(limit, "Limiting chunk count");
            chunks.truncate(limit);
        }
    }

    if chunks.is_empty() {
        return Err(SourceError::NoChunks(format!("{source:?} source")));
    }

    info!(chunks = chunks.len(), ?source, "Chunks loaded");
    Ok(chunks)
}

/// Reads and re-chunks the vault's markdown notes.
pub async fn chunks_from_vault(config: &SourceConfig) -> Result<Vec<Chunk>, SourceError> {
    let vault = config
        .vault_path
        .as_deref()
        .ok_or_else(|| SourceError::NoChunks("vault (no vault_path configured)".to_string()))?;

    let reader = VaultReader::new(config.min_document_len, config.max_files);
    let documents = reader.read_vault(vault).await?;
    let chunker = config.chunker();

    let chunks: Vec<Chunk> = documents
        .iter()
        .flat_map(|(path, body)| chunker.chunk_text(body, path))
        .collect();

    info!(
        documents = documents.len(),
        chunks = chunks.len(),
        vault = %vault.display(),
        "Vault chunked"
    );
    Ok(chunks)
}

/// Converts a vector store export into chunks, ordered by source path then position.
pub async fn chunks_from_store(store: &dyn VectorStore) -> Result<Vec<Chunk>, SourceError> {
    let documents = store.list_all().await?;

    let mut chunks: Vec<Chunk> = documents
        .into_iter()
        .enumerate()
        .map(|(position, doc)| {
            let path = note_path(&doc.metadata);
            let chunk_index = ["chunk_index", "chunk"]
                .iter()
                .find_map(|key| doc.metadata.get(*key).and_then(Value::as_u64))
                .map(|i| i as usize)
                .unwrap_or(position);

            Chunk::new(
                doc.text,
                SourceMetadata {
                    path,
                    offset: 0,
                    chunk_index,
                },
            )
        })
        .collect();

    chunks.sort_by(|a, b| {
        (&a.source.path, a.source.chunk_index, &a.id).cmp(&(
            &b.source.path,
            b.source.chunk_index,
            &b.id,
        ))
    });
    Ok(chunks)
}

/// A semantic-search result resolved to the note it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteHit {
    pub path: String,
    pub score: f32,
    pub content: String,
}

/// Best-matching notes for `query`, highest score first, empty passages dropped.
pub async fn search_notes(
    store: &dyn VectorStore,
    query: &str,
    top_k: usize,
) -> Result<Vec<NoteHit>, SourceError> {
    let hits = store.search(query, top_k).await?;
    let mut notes: Vec<NoteHit> = hits
        .into_iter()
        .filter(|hit| !hit.text.trim().is_empty())
        .map(|hit| NoteHit {
            path: note_path(&hit.metadata),
            score: hit.score,
            content: hit.text,
        })
        .collect();

    notes.sort_by(|a, b| b.score.total_cmp(&a.score));
    notes.truncate(top_k);
    info!(query, results = notes.len(), "Vault search finished");
    Ok(notes)
}

fn note_path(metadata: &Metadata) -> String {
    ["filepath", "path", "source", "filename"]
        .iter()
        .find_map(|key| metadata.get(*key).and_then(Value::as_str))
        .unwrap_or("unknown")
        .to_string()
}
