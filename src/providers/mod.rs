//! Provider abstraction: a closed set of LLM backends behind one trait.
//!
//! `chat_stream` always yields canonical chunk payloads — the OpenAI
//! chat-completion streaming shape (`choices[0].delta.content`, terminated
//! by a chunk carrying `finish_reason`). Providers with a different native
//! wire format translate inside their `chat_stream`; consumers never see
//! provider-specific chunk shapes.

pub mod anthropic;
pub mod embeddings;
mod http;
pub mod mock;
pub mod ollama;
pub mod openai;
mod sse;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use crate::config::{Config, RuntimeEnv};
use crate::models::llm::{ChatRequest, ChatResponse};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("upstream returned {status}: {body}")]
    Http { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("API key required for provider '{0}'")]
    MissingApiKey(String),
}

impl ProviderError {
    /// 5xx responses and transport errors are retryable; 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status >= 500,
            ProviderError::Network(_) => true,
            _ => false,
        }
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_model(&self, model: &str) -> bool;

    async fn chat(&self, request: &ChatRequest, api_key: Option<&str>)
        -> Result<ChatResponse, ProviderError>;

    /// Canonical chunk payloads (JSON strings without the `data: ` framing).
    async fn chat_stream(
        &self,
        request: &ChatRequest,
        api_key: Option<&str>,
    ) -> Result<ChunkStream, ProviderError>;
}

/// Local providers run without an upstream API key and get the longer
/// call deadline.
pub fn is_local_provider(name: &str) -> bool {
    matches!(name, "mock" | "ollama" | "lmstudio")
}

/// Fixed-order provider registry. The dispatch order is documented and
/// stable: mock first when the gateway runs in test mode, then the explicit
/// `lmstudio/` prefix, then the Ollama local-model family, then OpenAI,
/// then Anthropic.
pub struct ProviderRegistry {
    providers: Vec<Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Arc<dyn LlmProvider>>) -> Self {
        ProviderRegistry { providers }
    }

    pub fn from_config(config: &Config) -> Self {
        let mut providers: Vec<Arc<dyn LlmProvider>> = vec![];
        if config.environment == RuntimeEnv::Test {
            providers.push(Arc::new(mock::MockProvider::new()));
        }
        providers.push(Arc::new(ollama::OllamaProvider::lmstudio(
            config.lmstudio_api_url.clone(),
        )));
        providers.push(Arc::new(ollama::OllamaProvider::new(
            config.ollama_api_url.clone(),
        )));
        providers.push(Arc::new(openai::OpenAiProvider::new(
            config.openai_api_url.clone(),
        )));
        providers.push(Arc::new(anthropic::AnthropicProvider::new(
            config.anthropic_api_url.clone(),
        )));
        if config.environment != RuntimeEnv::Test {
            // Mock still serves test-model/mock-* outside test mode, but
            // only after every real provider declined.
            providers.push(Arc::new(mock::MockProvider::new()));
        }
        ProviderRegistry::new(providers)
    }

    /// First provider whose `supports_model` returns true.
    pub fn select(&self, model: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers
            .iter()
            .find(|p| p.supports_model(model))
            .cloned()
    }
}
