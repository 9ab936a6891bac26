use chrono::{DateTime, Utc};
use graph::KnowledgeGraph;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::error::CheckpointError;
use crate::persist::{read_json, write_json_atomic};
use crate::stats::BuildStats;

pub const ARTIFACT_FILE: &str = "knowledge_graph.json";

/// Finished graph as handed to the query side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphArtifact {
    pub graph: KnowledgeGraph,
    #[serde(default)]
    pub stats: BuildStats,
    /// Checkpoint this graph matches; checkpoints past it are newer work
    #[serde(default)]
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
}

impl From<Checkpoint> for GraphArtifact {
    fn from(checkpoint: Checkpoint) -> Self {
        Self {
            graph: checkpoint.graph,
            stats: checkpoint.stats,
            sequence: checkpoint.sequence,
            created_at: checkpoint.timestamp,
        }
    }
}

impl GraphArtifact {
    pub fn write(&self, dir: &Path) -> Result<PathBuf, CheckpointError> {
        let path = dir.join(ARTIFACT_FILE);
        write_json_atomic(&path, self)?;
        info!(
            nodes = self.graph.node_count(),
            edges = self.graph.edge_count(),
            path = %path.display(),
            "Wrote graph artifact"
        );
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, CheckpointError> {
        read_json(path)
    }

    /// The newest graph in `dir`: the final artifact, unless a later checkpoint
    /// exists (a build cancelled or restarted after the artifact was written).
    pub fn load_or_latest(dir: &Path) -> Result<Self, CheckpointError> {
        let path = dir.join(ARTIFACT_FILE);
        let artifact = if path.exists() {
            match Self::load(&path) {
                Ok(artifact) => Some(artifact),
                Err(e) => {
                    warn!(error = %e, "Graph artifact unreadable, trying checkpoints");
                    None
                }
            }
        } else {
            None
        };

        let checkpoints = CheckpointManager::new(dir, 1);
        let newest = checkpoints.list()?.last().map(|info| info.sequence);
        let artifact = match artifact {
            Some(artifact) if newest.is_none_or(|sequence| sequence <= artifact.sequence) => {
                return artifact_loaded(artifact);
            }
            other => other,
        };

        match (checkpoints.load_latest(), artifact) {
            (Ok(Some(checkpoint)), Some(artifact)) if checkpoint.sequence <= artifact.sequence => {
                artifact_loaded(artifact)
            }
            (Ok(Some(checkpoint)), _) => {
                info!(sequence = checkpoint.sequence, "Loaded graph from checkpoint");
                Ok(checkpoint.into())
            }
            (Ok(None), Some(artifact)) => artifact_loaded(artifact),
            (Ok(None), None) => Err(CheckpointError::NotFound(dir.to_path_buf())),
            (Err(e), Some(artifact)) => {
                warn!(error = %e, "No readable checkpoint, using graph artifact");
                Ok(artifact)
            }
            (Err(e), None) => Err(e),
        }
    }
}

fn artifact_loaded(artifact: GraphArtifact) -> Result<GraphArtifact, CheckpointError> {
    info!(sequence = artifact.sequence, "Loaded graph artifact");
    Ok(artifact)
}
