pub mod artifact;
pub mod checkpoint;
pub mod error;
pub mod failed;
pub mod orchestrator;
mod persist;
pub mod stats;

pub use artifact::{ARTIFACT_FILE, GraphArtifact};
pub use checkpoint::{Checkpoint, CheckpointHandle, CheckpointInfo, CheckpointManager};
pub use error::{BuildError, CheckpointError};
pub use failed::{FAILED_CHUNKS_FILE, FailedChunk, FailedChunkStore};
pub use orchestrator::{BuildOrchestrator, BuildReport};
pub use stats::BuildStats;

use extract::{ExtractorConfig, LlmConfig, ModelTier, RetryConfig};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub checkpoint_dir: PathBuf,
    /// Chunks between checkpoints
    pub checkpoint_interval: usize,
    pub keep_checkpoints: usize,
    pub min_chunk_chars: usize,
    pub max_prompt_chars: usize,
    /// Extractions in flight at once; merges stay sequential
    pub concurrency: usize,
    pub tier: ModelTier,
    /// Used for the up-front estimate until a build has real cost history
    pub estimated_cost_per_chunk: f64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("graph_data"),
            checkpoint_interval: 10,
            keep_checkpoints: 3,
            min_chunk_chars: 50,
            max_prompt_chars: 8000,
            concurrency: 1,
            tier: ModelTier::Fast,
            estimated_cost_per_chunk: 0.0014,
        }
    }
}

impl BuildConfig {
    /// Extractor settings for `tier`; the quality tier gets the larger token budget.
    pub fn extractor_config(&self, llm: &LlmConfig, retry: RetryConfig, tier: ModelTier) -> ExtractorConfig {
        let mut config = ExtractorConfig {
            min_chunk_chars: self.min_chunk_chars,
            max_prompt_chars: self.max_prompt_chars,
            ..ExtractorConfig::from_llm(llm, retry)
        };
        if tier == ModelTier::Quality {
            config.max_tokens = llm.retry_max_tokens;
        }
        config
    }
}
