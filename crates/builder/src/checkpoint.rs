use chrono::{DateTime, Utc};
use graph::KnowledgeGraph;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::CheckpointError;
use crate::persist::{TMP_EXTENSION, read_json, write_json_atomic};
use crate::stats::BuildStats;

const PREFIX: &str = "graph_checkpoint_";
const EXTENSION: &str = ".json";

/// Self-contained snapshot of a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub sequence: u64,
    pub graph: KnowledgeGraph,
    #[serde(default)]
    pub stats: BuildStats,
    /// Absent in older checkpoints; an empty set just means chunks get replayed
    #[serde(default)]
    pub processed_chunks: BTreeSet<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub sequence: u64,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointInfo {
    pub sequence: u64,
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Numbered checkpoint files in one directory.
///
/// "Latest" is the highest sequence in the file name; modification times are
/// never consulted since checkpoint directories get copied between machines.
pub struct CheckpointManager {
    dir: PathBuf,
    keep: usize,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            dir: dir.into(),
            keep: keep.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(sequence: u64) -> String {
        format!("{PREFIX}{sequence:08}{EXTENSION}")
    }

    /// Sequence encoded in a checkpoint file name, parsed numerically.
    pub fn parse_sequence(file_name: &str) -> Option<u64> {
        file_name
            .strip_prefix(PREFIX)?
            .strip_suffix(EXTENSION)?
            .parse()
            .ok()
    }

    /// All checkpoints, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointInfo>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };

        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(sequence) = name.to_str().and_then(Self::parse_sequence) else {
                continue;
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            found.push(CheckpointInfo {
                sequence,
                path: entry.path(),
                size_bytes,
            });
        }

        found.sort_by_key(|info| info.sequence);
        Ok(found)
    }

    pub fn next_sequence(&self) -> Result<u64, CheckpointError> {
        Ok(self.list()?.last().map_or(1, |info| info.sequence + 1))
    }

    /// Writes atomically, verifies the file loads, then prunes older checkpoints.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<CheckpointHandle, CheckpointError> {
        let path = self.dir.join(Self::file_name(checkpoint.sequence));
        write_json_atomic(&path, checkpoint)?;

        // Never prune on the strength of an unverified file
        self.load(&path)?;

        info!(
            sequence = checkpoint.sequence,
            nodes = checkpoint.graph.node_count(),
            edges = checkpoint.graph.edge_count(),
            processed = checkpoint.processed_chunks.len(),
            path = %path.display(),
            "Checkpoint saved"
        );

        self.prune()?;
        Ok(CheckpointHandle {
            sequence: checkpoint.sequence,
            path,
        })
    }

    pub fn load(&self, path: &Path) -> Result<Checkpoint, CheckpointError> {
        read_json(path)
    }

    /// Newest loadable checkpoint, falling back past unreadable ones.
    ///
    /// `Ok(None)` means there are no checkpoints at all. When checkpoints exist
    /// but none loads, this fails rather than letting a build start from empty.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>, CheckpointError> {
        let candidates = self.list()?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut tried = 0;
        for info in candidates.iter().rev() {
            match self.load(&info.path) {
                Ok(checkpoint) => {
                    if tried > 0 {
                        warn!(
                            sequence = info.sequence,
                            skipped = tried,
                            "Resumed from an older checkpoint; newer ones were unreadable"
                        );
                    }
                    return Ok(Some(checkpoint));
                }
                Err(e) => {
                    warn!(sequence = info.sequence, error = %e, "Skipping unreadable checkpoint");
                    tried += 1;
                }
            }
        }

        Err(CheckpointError::NoValidCheckpoint {
            dir: self.dir.clone(),
            tried,
        })
    }

    fn prune(&self) -> Result<(), CheckpointError> {
        let all = self.list()?;
        let excess = all.len().saturating_sub(self.keep);
        for info in &all[..excess] {
            fs::remove_file(&info.path).map_err(|e| CheckpointError::io(&info.path, e))?;
            debug!(sequence = info.sequence, "Pruned old checkpoint");
        }

        // Leftovers from a crash between temp write and rename
        if let Ok(entries) = fs::read_dir(&self.dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                let stale = path.extension().is_some_and(|ext| ext == TMP_EXTENSION)
                    && path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(PREFIX));
                if stale {
                    let _ = fs::remove_file(&path);
                }
            }
        }
        Ok(())
    }
}
