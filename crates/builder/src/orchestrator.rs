use chrono::Utc;
use extract::{ExtractionOutcome, ExtractionStatus, Extractor};
use futures::stream::{self, StreamExt};
use graph::KnowledgeGraph;
use ingest::Chunk;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::BuildConfig;
use crate::artifact::GraphArtifact;
use crate::checkpoint::{Checkpoint, CheckpointHandle, CheckpointManager};
use crate::error::BuildError;
use crate::failed::FailedChunkStore;
use crate::stats::BuildStats;

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    /// Unique chunks handed to this run
    pub total_chunks: usize,
    /// Of those, already in the processed set at start
    pub already_processed: usize,
    /// This run only
    pub session: BuildStats,
    /// Accumulated over every run of this graph
    pub totals: BuildStats,
    pub nodes: usize,
    pub edges: usize,
    pub failed_chunks: usize,
    pub cancelled: bool,
    pub last_checkpoint: Option<u64>,
    pub artifact: Option<PathBuf>,
}

/// Everything a checkpoint captures. Mutated only by the orchestrator's consumer loop.
struct BuildState {
    graph: KnowledgeGraph,
    stats: BuildStats,
    processed: BTreeSet<String>,
    failed: FailedChunkStore,
    sequence: u64,
}

impl BuildState {
    fn apply(&mut self, chunk: &Chunk, outcome: &ExtractionOutcome, session: &mut BuildStats) {
        let mut delta = BuildStats::default();
        delta.record(outcome);

        match &outcome.status {
            ExtractionStatus::Extracted(result) => {
                let merged = self.graph.merge(result, &chunk.id);
                self.graph.record_source(&chunk.id, &chunk.source.path);
                self.processed.insert(chunk.id.clone());

                // An earlier pass already failed this chunk
                if self.failed.remove(&chunk.id).is_some() && !outcome.succeeded_after_retry() {
                    delta.successful_retries += 1;
                }

                info!(
                    chunk_id = %chunk.id,
                    source = %chunk.source.path,
                    entities = result.entities.len(),
                    relationships = result.relationships.len(),
                    new_entities = merged.new_entities,
                    "Chunk extracted"
                );
            }
            ExtractionStatus::Skipped => {
                self.processed.insert(chunk.id.clone());
            }
            ExtractionStatus::Failed(e) => {
                self.failed.record(chunk, &e.to_string(), outcome.attempts);
            }
        }

        *session += &delta;
        self.stats += &delta;
    }

    fn checkpoint(&mut self, manager: &CheckpointManager) -> Result<CheckpointHandle, BuildError> {
        let sequence = manager.next_sequence()?.max(self.sequence + 1);

        // The failed record and the checkpoint travel together
        self.failed.save()?;
        let handle = manager.save(&Checkpoint {
            sequence,
            graph: self.graph.clone(),
            stats: self.stats.clone(),
            processed_chunks: self.processed.clone(),
            timestamp: Utc::now(),
        })?;

        self.sequence = sequence;
        Ok(handle)
    }
}

struct PassResult {
    session: BuildStats,
    cancelled: bool,
    last_checkpoint: Option<u64>,
}

/// Drives extraction over a chunk sequence with resume, checkpoints and cancellation.
pub struct BuildOrchestrator {
    extractor: Extractor,
    config: BuildConfig,
    checkpoints: CheckpointManager,
    state: BuildState,
}

impl BuildOrchestrator {
    /// Starts an empty graph, ignoring anything already on disk.
    pub fn new(extractor: Extractor, config: BuildConfig) -> Self {
        let checkpoints = CheckpointManager::new(&config.checkpoint_dir, config.keep_checkpoints);
        let failed = FailedChunkStore::empty(&config.checkpoint_dir);
        Self {
            extractor,
            config,
            checkpoints,
            state: BuildState {
                graph: KnowledgeGraph::new(),
                stats: BuildStats::default(),
                processed: BTreeSet::new(),
                failed,
                sequence: 0,
            },
        }
    }

    /// Continues from the latest checkpoint, or starts empty when there is none.
    ///
    /// Fails when checkpoints exist but none is loadable.
    pub fn resume(extractor: Extractor, config: BuildConfig) -> Result<Self, BuildError> {
        let mut orchestrator = Self::new(extractor, config);
        orchestrator.state.failed = FailedChunkStore::load(orchestrator.checkpoints.dir())?;

        match orchestrator.checkpoints.load_latest()? {
            Some(checkpoint) => {
                info!(
                    sequence = checkpoint.sequence,
                    processed = checkpoint.processed_chunks.len(),
                    nodes = checkpoint.graph.node_count(),
                    edges = checkpoint.graph.edge_count(),
                    failed = orchestrator.state.failed.len(),
                    "Resuming from checkpoint"
                );
                let state = &mut orchestrator.state;
                state.graph = checkpoint.graph;
                state.stats = checkpoint.stats;
                state.processed = checkpoint.processed_chunks;
                state.sequence = checkpoint.sequence;
            }
            None => info!(
                dir = %orchestrator.checkpoints.dir().display(),
                "No checkpoint found, starting a new graph"
            ),
        }

        Ok(orchestrator)
    }

    pub fn graph(&self) -> &KnowledgeGraph {
        &self.state.graph
    }

    pub fn stats(&self) -> &BuildStats {
        &self.state.stats
    }

    pub fn processed_chunks(&self) -> &BTreeSet<String> {
        &self.state.processed
    }

    pub fn failed_chunks(&self) -> &FailedChunkStore {
        &self.state.failed
    }

    /// Extracts every chunk not yet processed, then writes the graph artifact.
    pub async fn run(
        &mut self,
        chunks: Vec<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<BuildReport, BuildError> {
        if chunks.is_empty() {
            return Err(BuildError::NoChunks);
        }

        let mut seen = HashSet::new();
        let unique: Vec<Chunk> = chunks
            .into_iter()
            .filter(|chunk| seen.insert(chunk.id.clone()))
            .collect();
        let total_chunks = unique.len();
        let pending: Vec<Chunk> = unique
            .into_iter()
            .filter(|chunk| !self.state.processed.contains(&chunk.id))
            .collect();
        let already_processed = total_chunks - pending.len();

        let per_chunk = self
            .state
            .stats
            .average_cost_per_chunk()
            .unwrap_or(self.config.estimated_cost_per_chunk);
        info!(
            total = total_chunks,
            already_processed,
            remaining = pending.len(),
            model = self.extractor.model_name(),
            estimated_cost_usd = per_chunk * pending.len() as f64,
            "Starting graph build"
        );

        let pass = self.process(pending, cancel).await?;
        self.finish(total_chunks, already_processed, pass)
    }

    /// Re-extracts the chunks in the failed record, typically with a stronger model.
    pub async fn retry_failed(&mut self, cancel: &CancellationToken) -> Result<BuildReport, BuildError> {
        let pending: Vec<Chunk> = self
            .state
            .failed
            .chunks()
            .map(|failed| failed.chunk.clone())
            .collect();
        let total_chunks = pending.len();

        if pending.is_empty() {
            info!("No failed chunks to retry");
        } else {
            info!(
                failed = total_chunks,
                model = self.extractor.model_name(),
                "Retrying failed chunks"
            );
        }

        let pass = self.process(pending, cancel).await?;
        self.finish(total_chunks, 0, pass)
    }

    /// Writes the current graph as the final artifact.
    pub fn write_artifact(&self) -> Result<PathBuf, BuildError> {
        let artifact = GraphArtifact {
            graph: self.state.graph.clone(),
            stats: self.state.stats.clone(),
            sequence: self.state.sequence,
            created_at: Utc::now(),
        };
        Ok(artifact.write(self.checkpoints.dir())?)
    }

    async fn process(
        &mut self,
        pending: Vec<Chunk>,
        cancel: &CancellationToken,
    ) -> Result<PassResult, BuildError> {
        let total = pending.len();
        let interval = self.config.checkpoint_interval.max(1);
        let concurrency = self.config.concurrency.max(1);

        let extractor = &self.extractor;
        let checkpoints = &self.checkpoints;
        let state = &mut self.state;

        let mut session = BuildStats::default();
        let mut handled = 0usize;
        let mut cancelled = false;
        let mut last_checkpoint = None;

        // Extraction may run ahead up to `concurrency` chunks; results come back
        // in submission order and are merged here, one at a time
        let mut results = stream::iter(pending)
            .map(move |chunk| async move {
                let outcome = extractor.extract(&chunk).await;
                (chunk, outcome)
            })
            .buffered(concurrency);

        loop {
            if cancel.is_cancelled() {
                warn!(
                    handled,
                    remaining = total - handled,
                    "Build cancelled, writing final checkpoint"
                );
                cancelled = true;
                break;
            }

            let Some((chunk, outcome)) = results.next().await else {
                break;
            };
            handled += 1;
            state.apply(&chunk, &outcome, &mut session);

            if handled % interval == 0 {
                last_checkpoint = Some(state.checkpoint(checkpoints)?.sequence);
                info!(
                    processed = handled,
                    total,
                    succeeded = session.chunks_succeeded,
                    errors = session.chunks_errored,
                    retries = session.retries,
                    successful_retries = session.successful_retries,
                    cost_usd = state.stats.cost_usd,
                    "Build progress"
                );
            }
        }

        if handled % interval != 0 {
            last_checkpoint = Some(state.checkpoint(checkpoints)?.sequence);
        }

        Ok(PassResult {
            session,
            cancelled,
            last_checkpoint,
        })
    }

    fn finish(
        &self,
        total_chunks: usize,
        already_processed: usize,
        pass: PassResult,
    ) -> Result<BuildReport, BuildError> {
        let artifact = if pass.cancelled {
            None
        } else {
            Some(self.write_artifact()?)
        };

        let report = BuildReport {
            total_chunks,
            already_processed,
            totals: self.state.stats.clone(),
            nodes: self.state.graph.node_count(),
            edges: self.state.graph.edge_count(),
            failed_chunks: self.state.failed.len(),
            cancelled: pass.cancelled,
            last_checkpoint: pass.last_checkpoint,
            artifact,
            session: pass.session,
        };

        info!(
            nodes = report.nodes,
            edges = report.edges,
            succeeded = report.session.chunks_succeeded,
            errors = report.session.chunks_errored,
            successful_retries = report.session.successful_retries,
            success_rate = %format!("{:.1}%", report.totals.success_rate()),
            total_cost_usd = report.totals.cost_usd,
            failed_chunks = report.failed_chunks,
            cancelled = report.cancelled,
            "Graph build finished"
        );
        Ok(report)
    }
}
