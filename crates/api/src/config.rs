use anyhow::{Context, Result};
use builder::BuildConfig;
use extract::{LlmConfig, ModelTier, ProviderKind, RetryConfig};
use ingest::SourceConfig;
use query::QueryConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "vault-graph.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub source: SourceConfig,
    pub build: BuildConfig,
    pub query: QueryConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OperationMode {
    /// Cheaper model, parallel extraction, fewer retries
    Fast,
    /// Stronger model, sequential extraction, more retries
    Accurate,
    /// Whatever the config file says
    Balanced,
}

impl AppConfig {
    /// Reads `path`, or `vault-graph.toml` when present, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Supported environment variables:
    /// - ANTHROPIC_API_KEY
    /// - VAULT_GRAPH_LLM_PROVIDER: `anthropic` or `ollama`
    /// - OBSIDIAN_VAULT_PATH
    /// - VAULT_GRAPH_CHECKPOINT_DIR
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.llm.api_key = Some(key);
        }

        if let Some(provider) = lookup("VAULT_GRAPH_LLM_PROVIDER") {
            match provider.trim().to_ascii_lowercase().as_str() {
                "anthropic" => self.llm.provider = ProviderKind::Anthropic,
                "ollama" => self.llm.provider = ProviderKind::Ollama,
                other => anyhow::bail!(
                    "Unknown VAULT_GRAPH_LLM_PROVIDER '{other}', expected 'anthropic' or 'ollama'"
                ),
            }
        }

        if let Some(vault) = lookup("OBSIDIAN_VAULT_PATH") {
            self.source.vault_path = Some(PathBuf::from(vault));
        }

        if let Some(dir) = lookup("VAULT_GRAPH_CHECKPOINT_DIR") {
            self.build.checkpoint_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn apply_mode(&mut self, mode: OperationMode) {
        match mode {
            OperationMode::Fast => {
                self.build.tier = ModelTier::Fast;
                self.build.concurrency = 4;
                self.retry.max_retries = 2;
                self.retry.initial_backoff_ms = 500;
                self.retry.max_backoff_ms = 5_000;
            }
            OperationMode::Accurate => {
                self.build.tier = ModelTier::Quality;
                self.build.concurrency = 1;
                self.retry.max_retries = 5;
                self.retry.initial_backoff_ms = 2_000;
                self.retry.max_backoff_ms = 30_000;
            }
            OperationMode::Balanced => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.build.checkpoint_interval, 10);
        assert_eq!(config.build.checkpoint_dir, PathBuf::from("graph_data"));
        assert_eq!(config.query.max_entities, 20);
        assert_eq!(config.query.bind, "0.0.0.0:8002");
        assert_eq!(config.llm.provider, ProviderKind::Anthropic);
        assert_eq!(config.source.chunk_max_size, 1000);
        assert!(!config.logging.json);
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [build]
            checkpoint_interval = 25
            concurrency = 2

            [llm]
            provider = "ollama"
            fast_model = "llama3"
            "#,
        )
        .unwrap();
        assert_eq!(config.build.checkpoint_interval, 25);
        assert_eq!(config.build.concurrency, 2);
        assert_eq!(config.build.keep_checkpoints, 3);
        assert_eq!(config.llm.provider, ProviderKind::Ollama);
        assert_eq!(config.llm.fast_model, "llama3");
        assert_eq!(config.llm.query_max_tokens, 3000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ANTHROPIC_API_KEY", "sk-test"),
            ("VAULT_GRAPH_LLM_PROVIDER", "Ollama"),
            ("OBSIDIAN_VAULT_PATH", "/notes"),
            ("VAULT_GRAPH_CHECKPOINT_DIR", "/tmp/graph"),
        ]);
        let mut config = AppConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.llm.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.llm.provider, ProviderKind::Ollama);
        assert_eq!(config.source.vault_path, Some(PathBuf::from("/notes")));
        assert_eq!(config.build.checkpoint_dir, PathBuf::from("/tmp/graph"));
    }

    #[test]
    fn test_unknown_provider_is_rejected() {
        let mut config = AppConfig::default();
        let err = config
            .apply_overrides(|key| (key == "VAULT_GRAPH_LLM_PROVIDER").then(|| "gpt".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("'gpt'"));
        assert_eq!(config.llm.provider, ProviderKind::Anthropic);
    }

    #[test]
    fn test_mode_presets() {
        let mut fast = AppConfig::default();
        fast.apply_mode(OperationMode::Fast);
        assert_eq!(fast.build.tier, ModelTier::Fast);
        assert_eq!(fast.build.concurrency, 4);
        assert_eq!(fast.retry.max_retries, 2);

        let mut accurate = AppConfig::default();
        accurate.build.concurrency = 3;
        accurate.apply_mode(OperationMode::Accurate);
        assert_eq!(accurate.build.tier, ModelTier::Quality);
        assert_eq!(accurate.build.concurrency, 1);
        assert_eq!(accurate.retry.max_retries, 5);

        let mut balanced = AppConfig::default();
        balanced.build.concurrency = 3;
        balanced.apply_mode(OperationMode::Balanced);
        assert_eq!(balanced.build.concurrency, 3);
    }

    #[test]
    fn test_api_key_is_not_written_back() {
        let mut config = AppConfig::default();
        config.llm.api_key = Some("secret".to_string());
        let text = toml::to_string(&config).unwrap();
        assert!(!text.contains("secret"));
    }
}
