use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::embeddings::EmbeddingClient;
use crate::error::SourceError;

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub text: String,
    pub score: f32,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDocument {
    pub text: String,
    pub metadata: Metadata,
}

/// Read-only view of the semantic-search index built over the vault.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>, SourceError>;

    /// Every stored document, in a stable order.
    async fn list_all(&self) -> Result<Vec<StoredDocument>, SourceError>;
}

/// Qdrant over its REST API. The document text lives in the `text` payload field.
pub struct QdrantStore {
    base_url: String,
    collection_name: String,
    client: reqwest::Client,
    embedding_client: EmbeddingClient,
    page_size: usize,
}

#[derive(Serialize)]
struct ScrollRequest {
    limit: usize,
    with_payload: bool,
    with_vector: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollResponse {
    result: ScrollResult,
}

#[derive(Deserialize)]
struct ScrollResult {
    points: Vec<ScrollPoint>,
    next_page_offset: Option<Value>,
}

#[derive(Deserialize)]
struct ScrollPoint {
    #[serde(default)]
    payload: Metadata,
}

#[derive(Serialize)]
struct SearchRequest {
    vector: Vec<f32>,
    limit: usize,
    with_payload: bool,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<ScoredPoint>,
}

#[derive(Deserialize)]
struct ScoredPoint {
    score: f32,
    #[serde(default)]
    payload: Metadata,
}

impl QdrantStore {
    pub fn new(base_url: String, collection_name: String, embedding_client: EmbeddingClient) -> Self {
        Self {
            base_url,
            collection_name,
            client: reqwest::Client::new(),
            embedding_client,
            page_size: 256,
        }
    }

    /// Points fetched per scroll request.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn split_payload(mut payload: Metadata) -> (String, Metadata) {
        let text = match payload.remove("text") {
            Some(Value::String(text)) => text,
            _ => String::new(),
        };
        (text, payload)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn search(&self, text: &str, top_k: usize) -> Result<Vec<SearchHit>, SourceError> {
        let vector = self.embedding_client.embed(text).await?;
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection_name
        );

        let response = self
            .client
            .post(&url)
            .json(&SearchRequest {
                vector,
                limit: top_k,
                with_payload: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(SourceError::VectorStore(format!(
                "search failed ({status}): {error_text}"
            )));
        }

        let parsed: SearchResponse = response.json().await?;
        Ok(parsed
            .result
            .into_iter()
            .map(|point| {
                let (text, metadata) = Self::split_payload(point.payload);
                SearchHit {
                    text,
                    score: point.score,
                    metadata,
                }
            })
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<StoredDocument>, SourceError> {
        let url = format!(
            "{}/collections/{}/points/scroll",
            self.base_url, self.collection_name
        );
        let mut documents = Vec::new();
        let mut offset = None;

        loop {
            let response = self
                .client
                .post(&url)
                .json(&ScrollRequest {
                    limit: self.page_size,
                    with_payload: true,
                    with_vector: false,
                    offset: offset.take(),
                })
                .send()
                .await?;

            if !response.status().is_success() {
                return Err(SourceError::VectorStore(format!(
                    "scroll of '{}' failed: {}",
                    self.collection_name,
                    response.status()
                )));
            }

            let page: ScrollResponse = response.json().await?;
            for point in page.result.points {
                let (text, metadata) = Self::split_payload(point.payload);
                if !text.trim().is_empty() {
                    documents.push(StoredDocument { text, metadata });
                }
            }

            match page.result.next_page_offset {
                Some(next) if !next.is_null() => offset = Some(next),
                _ => break,
            }
        }

        Ok(documents)
    }
}
