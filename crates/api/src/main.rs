mod chat;
mod config;
mod server;

use anyhow::{Context, Result};
use builder::{BuildOrchestrator, BuildReport, CheckpointManager, GraphArtifact};
use clap::{Parser, Subcommand};
use extract::{Extractor, ModelTier};
use ingest::ChunkSource;
use query::{Answer, GraphQueryEngine};
use serde::Serialize;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use config::{AppConfig, LoggingConfig, OperationMode};

#[derive(Parser)]
#[command(name = "vault-graph")]
#[command(about = "Build and query a knowledge graph of an Obsidian vault", long_about = None)]
struct Cli {
    /// TOML config file (defaults to ./vault-graph.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Preset for model tier, concurrency and retries
    #[arg(long, value_enum, default_value = "balanced")]
    mode: OperationMode,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract entities from every chunk, resuming from the latest checkpoint
    Build {
        /// vault, vectorstore or auto
        #[arg(long, default_value = "auto")]
        source: ChunkSource,

        /// Ignore existing checkpoints and start a new graph
        #[arg(long)]
        fresh: bool,

        /// Only process the first N chunks
        #[arg(long)]
        limit: Option<usize>,

        /// Use the quality model tier
        #[arg(long)]
        quality: bool,
    },

    /// Re-extract chunks recorded as failed, with the larger token budget
    RetryFailed {
        /// Use the quality model tier
        #[arg(long)]
        quality: bool,
    },

    /// List checkpoints in the checkpoint directory
    Checkpoints,

    /// Answer a question from the graph
    Query {
        question: String,

        #[arg(long)]
        max_entities: Option<usize>,
    },

    /// Show an entity and its relationships
    Entity { name: String },

    /// Find paths between two entities
    Path {
        source: String,
        target: String,

        #[arg(long)]
        max_depth: Option<usize>,
    },

    /// Search entity names
    Search {
        query: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Semantic search over the vault's vector store
    SearchNotes {
        query: String,

        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Graph statistics
    Stats {
        /// Number of most-connected entities to list
        #[arg(long)]
        top: Option<usize>,
    },

    /// Interactive question loop
    Chat,

    /// Serve the query API over HTTP
    Serve {
        /// Listen address, overriding the config
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_mode(cli.mode);
    init_tracing(&config.logging, cli.log_json);

    match cli.command {
        Commands::Build {
            source,
            fresh,
            limit,
            quality,
        } => build(&config, source, fresh, limit, quality).await,
        Commands::RetryFailed { quality } => retry_failed(&config, quality).await,
        Commands::Checkpoints => list_checkpoints(&config),
        Commands::Query {
            question,
            max_entities,
        } => {
            let engine = load_engine(&config, true)?;
            let limit = max_entities.unwrap_or(config.query.max_entities);
            print_answer(&engine.answer_with_limit(&question, limit).await);
            Ok(())
        }
        Commands::Entity { name } => {
            let engine = load_engine(&config, false)?;
            match engine.get_entity_info(&name) {
                Some(info) => print_json(&info),
                None => anyhow::bail!("Entity '{name}' not found"),
            }
        }
        Commands::Path {
            source,
            target,
            max_depth,
        } => {
            let engine = load_engine(&config, false)?;
            let depth = max_depth.unwrap_or(config.query.max_path_depth);
            print_json(&engine.find_paths(&source, &target, depth))
        }
        Commands::Search { query, limit } => {
            let engine = load_engine(&config, false)?;
            let limit = limit.unwrap_or(config.query.search_limit);
            print_json(&engine.search_entities(&query, limit))
        }
        Commands::SearchNotes { query, limit } => search_notes(&config, &query, limit).await,
        Commands::Stats { top } => {
            let engine = load_engine(&config, false)?;
            print_json(&engine.stats(top.unwrap_or(config.query.top_entities)))
        }
        Commands::Chat => {
            let engine = load_engine(&config, true)?;
            chat::run(&engine).await
        }
        Commands::Serve { bind } => {
            let engine = load_engine(&config, true)?;
            let bind = bind.unwrap_or_else(|| config.query.bind.clone());
            server::serve(engine, &bind, cancel_on_ctrl_c()).await
        }
    }
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let registry = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so command output on stdout stays parseable
    if json || logging.json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Token cancelled by the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work before exiting");
            trigger.cancel();
        }
    });
    token
}

fn tier(config: &AppConfig, quality: bool) -> ModelTier {
    if quality {
        ModelTier::Quality
    } else {
        config.build.tier
    }
}

fn extractor(config: &AppConfig, tier: ModelTier) -> Result<Extractor> {
    let provider = config
        .llm
        .build_provider(tier)
        .context("Failed to create LLM provider")?;
    let extractor_config = config
        .build
        .extractor_config(&config.llm, config.retry.clone(), tier);
    Ok(Extractor::new(provider, extractor_config))
}

async fn build(
    config: &AppConfig,
    source: ChunkSource,
    fresh: bool,
    limit: Option<usize>,
    quality: bool,
) -> Result<()> {
    let mut source_config = config.source.clone();
    if limit.is_some() {
        source_config.limit = limit;
    }
    let chunks = ingest::load_chunks(source, &source_config)
        .await
        .context("Failed to load chunks")?;

    let extractor = extractor(config, tier(config, quality))?;
    let mut orchestrator = if fresh {
        BuildOrchestrator::new(extractor, config.build.clone())
    } else {
        BuildOrchestrator::resume(extractor, config.build.clone())?
    };

    let report = orchestrator.run(chunks, &cancel_on_ctrl_c()).await?;
    print_report(&report);
    Ok(())
}

async fn retry_failed(config: &AppConfig, quality: bool) -> Result<()> {
    let tier = tier(config, quality);
    let provider = config
        .llm
        .build_provider(tier)
        .context("Failed to create LLM provider")?;
    let mut extractor_config = config
        .build
        .extractor_config(&config.llm, config.retry.clone(), tier);
    extractor_config.max_tokens = config.llm.retry_max_tokens;

    let extractor = Extractor::new(provider, extractor_config);
    let mut orchestrator = BuildOrchestrator::resume(extractor, config.build.clone())?;
    let report = orchestrator.retry_failed(&cancel_on_ctrl_c()).await?;
    print_report(&report);
    Ok(())
}

fn list_checkpoints(config: &AppConfig) -> Result<()> {
    let manager = CheckpointManager::new(&config.build.checkpoint_dir, config.build.keep_checkpoints);
    let checkpoints = manager.list()?;
    if checkpoints.is_empty() {
        println!("No checkpoints in {}", manager.dir().display());
    }
    for checkpoint in checkpoints {
        println!(
            "{:>8}  {:>10} bytes  {}",
            checkpoint.sequence,
            checkpoint.size_bytes,
            checkpoint.path.display()
        );
    }
    Ok(())
}

async fn search_notes(config: &AppConfig, query: &str, limit: usize) -> Result<()> {
    let store = config
        .source
        .qdrant_store()
        .context("No vector store configured; set source.qdrant_url")?;
    let notes = ingest::search_notes(&store, query, limit)
        .await
        .context("Vault search failed")?;

    if notes.is_empty() {
        println!("No results for '{query}'");
    }
    for (rank, note) in notes.iter().enumerate() {
        println!("{}. {}  (score {:.3})", rank + 1, note.path, note.score);
        println!("{}\n", truncate_chars(&note.content, 1000));
    }
    Ok(())
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn load_engine(config: &AppConfig, with_llm: bool) -> Result<GraphQueryEngine> {
    let dir = &config.build.checkpoint_dir;
    let artifact = GraphArtifact::load_or_latest(dir)
        .with_context(|| format!("No graph found in {}; run `vault-graph build` first", dir.display()))?;
    info!(
        nodes = artifact.graph.node_count(),
        edges = artifact.graph.edge_count(),
        built = %artifact.created_at,
        "Loaded knowledge graph"
    );

    let engine = GraphQueryEngine::new(artifact.graph, config.query.clone());
    if !with_llm {
        return Ok(engine);
    }

    // Answers go to the stronger model; structural queries still work without one
    match config.llm.build_provider(ModelTier::Quality) {
        Ok(llm) => Ok(engine.with_llm(llm, config.llm.timeout())),
        Err(e) => {
            warn!(error = %e, "No LLM available, answers will list graph facts only");
            Ok(engine)
        }
    }
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn print_answer(answer: &Answer) {
    println!("{}", answer.text);
    if !answer.entities_considered.is_empty() {
        println!("\nEntities: {}", answer.entities_considered.join(", "));
    }
    if !answer.sources.is_empty() {
        println!("Sources:");
        for source in &answer.sources {
            println!("  - {source}");
        }
    }
}

fn print_report(report: &BuildReport) {
    let totals = &report.totals;
    println!("{}", "=".repeat(60));
    if report.cancelled {
        println!("Build interrupted; progress saved, rerun to resume");
    } else {
        println!("Build complete");
    }
    println!("  Chunks:          {} ({} already processed)", report.total_chunks, report.already_processed);
    println!(
        "  This run:        {} succeeded, {} errored, {} skipped, {} retries",
        report.session.chunks_succeeded,
        report.session.chunks_errored,
        report.session.chunks_skipped,
        report.session.retries
    );
    println!("  Graph:           {} entities, {} relationships", report.nodes, report.edges);
    println!("  Success rate:    {:.1}%", totals.success_rate());
    println!(
        "  Tokens:          {} in, {} out",
        totals.input_tokens, totals.output_tokens
    );
    println!("  Total cost:      ${:.4}", totals.cost_usd);
    if report.failed_chunks > 0 {
        println!(
            "  Failed chunks:   {} (run `vault-graph retry-failed`)",
            report.failed_chunks
        );
    }
    if let Some(path) = &report.artifact {
        println!("  Graph artifact:  {}", path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_chars_respects_char_boundaries() {
        assert_eq!(truncate_chars("short", 10), "short");
        assert_eq!(truncate_chars("Ärzte über Schmerz", 5), "Ärzte...");
    }

    #[test]
    fn test_search_notes_command_parses() {
        let cli = Cli::parse_from(["vault-graph", "search-notes", "lymphoma treatment", "--limit", "5"]);
        assert!(matches!(
            cli.command,
            Commands::SearchNotes { ref query, limit: 5 } if query == "lymphoma treatment"
        ));
    }
}
