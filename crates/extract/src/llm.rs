use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the provider for JSON-only output where it supports that
    pub json_mode: bool,
}

impl CompletionRequest {
    pub fn new(prompt: String, max_tokens: u32) -> Self {
        Self {
            prompt,
            max_tokens,
            temperature: 0.3,
            json_mode: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl Pricing {
    pub fn cost(&self, usage: TokenUsage) -> f64 {
        usage.input_tokens as f64 * self.input_per_million / 1_000_000.0
            + usage.output_tokens as f64 * self.output_per_million / 1_000_000.0
    }
}

/// A text-completion backend shared by extraction and query synthesis.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;

    fn model_name(&self) -> &str;

    fn pricing(&self) -> Pricing {
        Pricing::default()
    }
}

/// Runs one completion under a deadline.
pub async fn complete_with_timeout(
    provider: &dyn LlmProvider,
    request: &CompletionRequest,
    timeout: Duration,
) -> Result<Completion, LlmError> {
    match tokio::time::timeout(timeout, provider.complete(request)).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(timeout)),
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    /// Cheaper and faster; the default for full builds
    #[default]
    Fast,
    /// Higher quality; used for re-running failed chunks
    Quality,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Anthropic,
    Ollama,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: ProviderKind,
    pub base_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub fast_model: String,
    pub quality_model: String,
    pub fast_pricing: Pricing,
    pub quality_pricing: Pricing,
    pub timeout_secs: u64,
    pub extraction_max_tokens: u32,
    /// Budget once a response has already failed to parse (often truncation)
    pub retry_max_tokens: u32,
    pub query_max_tokens: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: ProviderKind::Anthropic,
            base_url: None,
            api_key: None,
            fast_model: "claude-haiku-4-5".to_string(),
            quality_model: "claude-sonnet-4-5".to_string(),
            fast_pricing: Pricing {
                input_per_million: 1.0,
                output_per_million: 5.0,
            },
            quality_pricing: Pricing {
                input_per_million: 3.0,
                output_per_million: 15.0,
            },
            timeout_secs: 120,
            extraction_max_tokens: 4096,
            retry_max_tokens: 6000,
            query_max_tokens: 3000,
        }
    }
}

impl LlmConfig {
    pub fn model_for(&self, tier: ModelTier) -> &str {
        match tier {
            ModelTier::Fast => &self.fast_model,
            ModelTier::Quality => &self.quality_model,
        }
    }

    pub fn pricing_for(&self, tier: ModelTier) -> Pricing {
        match (self.provider, tier) {
            (ProviderKind::Ollama, _) => Pricing::default(),
            (_, ModelTier::Fast) => self.fast_pricing,
            (_, ModelTier::Quality) => self.quality_pricing,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn build_provider(&self, tier: ModelTier) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let model = self.model_for(tier).to_string();
        match self.provider {
            ProviderKind::Anthropic => {
                let api_key = self
                    .api_key
                    .clone()
                    .filter(|key| !key.is_empty())
                    .ok_or(LlmError::MissingApiKey("anthropic"))?;
                let base_url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "https://api.anthropic.com".to_string());
                Ok(Arc::new(AnthropicClient::new(
                    base_url,
                    api_key,
                    model,
                    self.pricing_for(tier),
                )))
            }
            ProviderKind::Ollama => {
                let base_url = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| "http://localhost:11434".to_string());
                Ok(Arc::new(OllamaClient::new(base_url, model)))
            }
        }
    }
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// Anthropic Messages API.
#[derive(Clone)]
pub struct AnthropicClient {
    base_url: String,
    api_key: String,
    model: String,
    pricing: Pricing,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicClient {
    pub fn new(base_url: String, api_key: String, model: String, pricing: Pricing) -> Self {
        Self {
            base_url,
            api_key,
            model,
            pricing,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for AnthropicClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/v1/messages", self.base_url);

        let body = MessagesRequest {
            model: &self.model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            messages: [Message {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let wait = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &text, wait));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            text: text.trim().to_string(),
            usage: TokenUsage {
                input_tokens: parsed.usage.input_tokens,
                output_tokens: parsed.usage.output_tokens,
            },
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn pricing(&self) -> Pricing {
        self.pricing
    }
}

/// Local models through Ollama's generate endpoint.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'static str>, // "json" for structured output
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

impl OllamaClient {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            base_url,
            model,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let url = format!("{}/api/generate", self.base_url);

        let body = OllamaRequest {
            model: &self.model,
            prompt: &request.prompt,
            stream: false,
            format: request.json_mode.then_some("json"),
            options: OllamaOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
            },
        };

        let response = self.client.post(&url).json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::from_status(status, &text, None));
        }

        let ollama_response: OllamaResponse = response.json().await?;

        Ok(Completion {
            text: ollama_response.response,
            usage: TokenUsage {
                input_tokens: ollama_response.prompt_eval_count,
                output_tokens: ollama_response.eval_count,
            },
        })
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sleepy;

    #[async_trait]
    impl LlmProvider for Sleepy {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, LlmError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Completion {
                text: String::new(),
                usage: TokenUsage::default(),
            })
        }

        fn model_name(&self) -> &str {
            "sleepy"
        }
    }

    #[test]
    fn test_pricing_cost() {
        let pricing = LlmConfig::default().pricing_for(ModelTier::Fast);
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 200_000,
        };
        assert!((pricing.cost(usage) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_tier_selects_model() {
        let config = LlmConfig::default();
        assert_eq!(config.model_for(ModelTier::Fast), "claude-haiku-4-5");
        assert_eq!(config.model_for(ModelTier::Quality), "claude-sonnet-4-5");
    }

    #[test]
    fn test_anthropic_requires_key() {
        let config = LlmConfig::default();
        assert!(matches!(
            config.build_provider(ModelTier::Fast),
            Err(LlmError::MissingApiKey(_))
        ));

        let ollama = LlmConfig {
            provider: ProviderKind::Ollama,
            ..LlmConfig::default()
        };
        let provider = ollama.build_provider(ModelTier::Quality).unwrap();
        assert_eq!(provider.model_name(), "claude-sonnet-4-5");
        assert_eq!(provider.pricing(), Pricing::default());
    }

    #[tokio::test]
    async fn test_undecodable_envelope_is_permanent() {
        let mut server = mockito::Server::new_async().await;
        let generate = server
            .mock("POST", "/api/generate")
            .with_header("content-type", "application/json")
            .with_body("<html>proxy error page</html>")
            .expect(1)
            .create_async()
            .await;

        let client = OllamaClient::new(server.url(), "llama3".into());
        let err = client
            .complete(&CompletionRequest::new("hi".into(), 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Permanent(_)));
        assert!(!err.is_retryable());
        generate.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/generate")
            .with_status(503)
            .with_body("loading model")
            .create_async()
            .await;

        let client = OllamaClient::new(server.url(), "llama3".into());
        let err = client
            .complete(&CompletionRequest::new("hi".into(), 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Transient(ref detail) if detail.contains("loading model")));
    }

    #[tokio::test]
    async fn test_timeout_maps_to_error() {
        let request = CompletionRequest::new("hi".into(), 10);
        let err = complete_with_timeout(&Sleepy, &request, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }
}
