pub mod error;
pub mod llm;
pub mod normalizer;
pub mod prompt;
pub mod recovery;
pub mod retry;
pub mod schema;

pub use error::{ExtractionError, LlmError, ParseFailure};
pub use llm::{
    AnthropicClient, Completion, CompletionRequest, LlmConfig, LlmProvider, ModelTier,
    OllamaClient, Pricing, ProviderKind, TokenUsage, complete_with_timeout,
};
pub use normalizer::{clean_name, normalize_key};
pub use recovery::{ParseAttempt, Recovered, recover_extraction};
pub use retry::{RetryConfig, RetryPolicy};
pub use schema::{ExtractedEntity, ExtractedRelationship, ExtractionResult};

use ingest::Chunk;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    /// Chunks shorter than this (trimmed, in chars) are skipped without a call
    pub min_chunk_chars: usize,
    pub max_prompt_chars: usize,
    pub max_tokens: u32,
    /// Token budget once a response has come back unparseable
    pub retry_max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_chunk_chars: 50,
            max_prompt_chars: 8000,
            max_tokens: 4096,
            retry_max_tokens: 6000,
            temperature: 0.3,
            request_timeout: Duration::from_secs(120),
            retry: RetryConfig::default(),
        }
    }
}

impl ExtractorConfig {
    /// Token budgets and timeout taken from the LLM settings.
    pub fn from_llm(llm: &LlmConfig, retry: RetryConfig) -> Self {
        Self {
            max_tokens: llm.extraction_max_tokens,
            retry_max_tokens: llm.retry_max_tokens,
            request_timeout: llm.timeout(),
            retry,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub enum ExtractionStatus {
    Extracted(ExtractionResult),
    /// Below the minimum length; no call was made
    Skipped,
    Failed(ExtractionError),
}

#[derive(Debug)]
pub struct ExtractionOutcome {
    pub chunk_id: String,
    pub status: ExtractionStatus,
    /// Provider calls made for this chunk
    pub attempts: u32,
    pub usage: TokenUsage,
    pub cost_usd: f64,
    /// Recovery strategy that produced the result
    pub strategy: Option<&'static str>,
}

impl ExtractionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self.status, ExtractionStatus::Extracted(_))
    }

    /// Succeeded, but not on the first call.
    pub fn succeeded_after_retry(&self) -> bool {
        self.is_success() && self.attempts > 1
    }
}

/// Turns chunks into validated entities and relationships through one provider.
pub struct Extractor {
    provider: Arc<dyn LlmProvider>,
    config: ExtractorConfig,
    policy: RetryPolicy,
}

impl Extractor {
    pub fn new(provider: Arc<dyn LlmProvider>, config: ExtractorConfig) -> Self {
        let policy = RetryPolicy::from_config(&config.retry);
        Self {
            provider,
            config,
            policy,
        }
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn config(&self) -> &ExtractorConfig {
        &self.config
    }

    /// Extracts one chunk, retrying transient and parse failures with backoff.
    ///
    /// Never returns an error: terminal failures come back as
    /// [`ExtractionStatus::Failed`] so a build can carry on.
    pub async fn extract(&self, chunk: &Chunk) -> ExtractionOutcome {
        let mut outcome = ExtractionOutcome {
            chunk_id: chunk.id.clone(),
            status: ExtractionStatus::Skipped,
            attempts: 0,
            usage: TokenUsage::default(),
            cost_usd: 0.0,
            strategy: None,
        };

        if chunk.text.trim().chars().count() < self.config.min_chunk_chars {
            debug!(chunk_id = %chunk.id, "Skipping short chunk");
            return outcome;
        }

        let max_attempts = self.policy.max_attempts();
        let mut strict = false;

        loop {
            outcome.attempts += 1;
            let request = self.request_for(chunk, strict);

            match self.attempt(&request, &mut outcome.usage).await {
                Ok(recovered) => {
                    let result = recovered.raw.validate();
                    if outcome.attempts > 1 {
                        info!(
                            chunk_id = %chunk.id,
                            attempts = outcome.attempts,
                            "Extraction succeeded after retries"
                        );
                    }
                    outcome.strategy = Some(recovered.strategy);
                    outcome.status = ExtractionStatus::Extracted(result);
                    break;
                }
                Err(e) => {
                    if !e.is_retryable() || outcome.attempts >= max_attempts {
                        error!(
                            chunk_id = %chunk.id,
                            source = %chunk.source.path,
                            attempts = outcome.attempts,
                            error = %e,
                            "Extraction failed"
                        );
                        outcome.status = ExtractionStatus::Failed(e);
                        break;
                    }

                    if matches!(e, ExtractionError::Parse(_)) {
                        strict = true;
                    }

                    let backoff = self.policy.delay_for(outcome.attempts, e.retry_after());
                    warn!(
                        chunk_id = %chunk.id,
                        attempt = outcome.attempts,
                        max_retries = max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Extraction attempt failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        outcome.cost_usd = self.provider.pricing().cost(outcome.usage);
        outcome
    }

    fn request_for(&self, chunk: &Chunk, strict: bool) -> CompletionRequest {
        let source = chunk.file_name();
        let max_chars = self.config.max_prompt_chars;

        // A parse failure usually means a truncated answer: more room, less randomness
        let (prompt, max_tokens, temperature) = if strict {
            (
                prompt::build_strict_extraction_prompt(&chunk.text, source, max_chars),
                self.config.retry_max_tokens,
                0.1,
            )
        } else {
            (
                prompt::build_extraction_prompt(&chunk.text, source, max_chars),
                self.config.max_tokens,
                self.config.temperature,
            )
        };

        CompletionRequest {
            prompt,
            max_tokens,
            temperature,
            json_mode: true,
        }
    }

    async fn attempt(
        &self,
        request: &CompletionRequest,
        usage: &mut TokenUsage,
    ) -> Result<Recovered, ExtractionError> {
        let completion =
            llm::complete_with_timeout(self.provider.as_ref(), request, self.config.request_timeout)
                .await?;
        *usage += completion.usage;

        let recovered = recover_extraction(&completion.text)?;
        if recovered.strategy != "direct" {
            debug!(strategy = recovered.strategy, "Recovered malformed extraction response");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ingest::SourceMetadata;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    const GOOD: &str = r#"{"entities":[{"name":"Aspirin","type":"medication"},{"name":"Headache","type":"condition"}],"relationships":[{"source":"Aspirin","target":"Headache","type":"treats"}]}"#;

    /// Replays scripted responses; the last one repeats once the script runs out.
    struct Scripted {
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        requests: Mutex<Vec<CompletionRequest>>,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
            self.requests.lock().unwrap().push(request.clone());
            let mut script = self.script.lock().unwrap();
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            next.unwrap_or_else(|| Err(LlmError::Permanent("empty script".into())))
                .map(|text| Completion {
                    text,
                    usage: TokenUsage {
                        input_tokens: 100,
                        output_tokens: 50,
                    },
                })
        }

        fn model_name(&self) -> &str {
            "scripted"
        }

        fn pricing(&self) -> Pricing {
            Pricing {
                input_per_million: 1.0,
                output_per_million: 5.0,
            }
        }
    }

    fn fast_config() -> ExtractorConfig {
        ExtractorConfig {
            retry: RetryConfig {
                max_retries: 3,
                initial_backoff_ms: 1,
                max_backoff_ms: 5,
            },
            ..ExtractorConfig::default()
        }
    }

    fn chunk(text: &str) -> Chunk {
        Chunk::new(
            text.to_string(),
            SourceMetadata {
                path: "notes/meds.md".into(),
                offset: 0,
                chunk_index: 0,
            },
        )
    }

    fn long_chunk() -> Chunk {
        chunk("Aspirin is commonly taken to treat a headache and other mild pain.")
    }

    #[tokio::test]
    async fn test_extracts_on_first_try() {
        let provider = Arc::new(Scripted::new(vec![Ok(GOOD.into())]));
        let extractor = Extractor::new(provider.clone(), fast_config());

        let outcome = extractor.extract(&long_chunk()).await;
        let ExtractionStatus::Extracted(result) = &outcome.status else {
            panic!("expected extraction, got {:?}", outcome.status);
        };
        assert_eq!(result.entities.len(), 2);
        assert_eq!(result.relationships.len(), 1);
        assert_eq!(outcome.attempts, 1);
        assert!(!outcome.succeeded_after_retry());
        assert_eq!(outcome.strategy, Some("direct"));
        assert!(outcome.cost_usd > 0.0);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_always_failing_provider_called_exactly_max_retries() {
        let provider = Arc::new(Scripted::new(vec![Err(LlmError::Transient("503".into()))]));
        let extractor = Extractor::new(provider.clone(), fast_config());

        let outcome = extractor.extract(&long_chunk()).await;
        assert!(matches!(outcome.status, ExtractionStatus::Failed(_)));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let provider = Arc::new(Scripted::new(vec![Err(LlmError::Permanent("400".into()))]));
        let extractor = Extractor::new(provider.clone(), fast_config());

        let outcome = extractor.extract(&long_chunk()).await;
        assert!(matches!(
            outcome.status,
            ExtractionStatus::Failed(ExtractionError::Llm(LlmError::Permanent(_)))
        ));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_parse_failures_then_success() {
        let provider = Arc::new(Scripted::new(vec![
            Ok("I cannot help with that.".into()),
            Err(LlmError::RateLimited { retry_after: None }),
            Ok(format!("```json\n{GOOD}\n```")),
        ]));
        let extractor = Extractor::new(provider.clone(), fast_config());

        let outcome = extractor.extract(&long_chunk()).await;
        assert!(outcome.succeeded_after_retry());
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.strategy, Some("strip_fences"));
        // Usage counts only calls that returned a completion
        assert_eq!(outcome.usage.input_tokens, 200);

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].max_tokens, 4096);
        assert_eq!(requests[1].max_tokens, 6000);
        assert!(requests[1].prompt.contains("not valid JSON"));
    }

    #[tokio::test]
    async fn test_short_chunk_skipped_without_call() {
        let provider = Arc::new(Scripted::new(vec![Ok(GOOD.into())]));
        let extractor = Extractor::new(provider.clone(), fast_config());

        let outcome = extractor.extract(&chunk("too short")).await;
        assert!(matches!(outcome.status, ExtractionStatus::Skipped));
        assert_eq!(outcome.attempts, 0);
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_unrecoverable_response_reports_parse_failure() {
        let provider = Arc::new(Scripted::new(vec![Ok("no json here".into())]));
        let extractor = Extractor::new(provider.clone(), fast_config());

        let outcome = extractor.extract(&long_chunk()).await;
        assert!(matches!(
            outcome.status,
            ExtractionStatus::Failed(ExtractionError::Parse(_))
        ));
        assert_eq!(provider.calls(), 3);
    }
}
