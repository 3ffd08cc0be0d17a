//! Embedding providers: OpenAI-compatible adapter plus a deterministic mock.

use async_trait::async_trait;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};

use super::http::{check_status, map_send_error, sync_client};
use super::ProviderError;
use crate::models::llm::{EmbeddingRequest, EmbeddingResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn supports_model(&self, model: &str) -> bool;
    async fn embed(
        &self,
        request: &EmbeddingRequest,
        api_key: Option<&str>,
    ) -> Result<EmbeddingResponse, ProviderError>;
}

pub struct OpenAiEmbeddingProvider {
    base_url: String,
    client: ClientWithMiddleware,
}

impl OpenAiEmbeddingProvider {
    pub fn new(base_url: Option<String>) -> Self {
        OpenAiEmbeddingProvider {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: sync_client(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("text-embedding")
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        api_key: Option<&str>,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let api_key = api_key.ok_or_else(|| ProviderError::MissingApiKey("openai".into()))?;

        let resp = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": request.model,
                "input": request.input,
                "encoding_format": "float",
            }))
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = check_status(resp).await?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;

        let mut embeddings = vec![];
        for item in data["data"].as_array().unwrap_or(&vec![]) {
            let vector: Vec<f32> = item["embedding"]
                .as_array()
                .unwrap_or(&vec![])
                .iter()
                .filter_map(|v| v.as_f64().map(|f| f as f32))
                .collect();
            embeddings.push(vector);
        }

        Ok(EmbeddingResponse {
            model: data["model"].as_str().unwrap_or(&request.model).to_string(),
            embeddings,
            total_tokens: data["usage"]["total_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }
}

/// Deterministic mock: a small vector derived from input lengths.
pub struct MockEmbeddingProvider;

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_model(&self, model: &str) -> bool {
        model == "test-model" || model.starts_with("mock-")
    }

    async fn embed(
        &self,
        request: &EmbeddingRequest,
        _api_key: Option<&str>,
    ) -> Result<EmbeddingResponse, ProviderError> {
        let embeddings = request
            .input
            .iter()
            .map(|text| {
                let len = text.len() as f32;
                vec![len / 100.0, (len % 10.0) / 10.0, 0.5]
            })
            .collect();
        let total_tokens: u32 = request
            .input
            .iter()
            .map(|t| (t.len() / 4).max(1) as u32)
            .sum();
        Ok(EmbeddingResponse {
            model: request.model.clone(),
            embeddings,
            total_tokens,
        })
    }
}
