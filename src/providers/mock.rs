//! Mock provider for tests and `test-model` / `mock-*` models.
//!
//! Deterministic: no network, token counts derived from word counts, and a
//! word-by-word canonical stream.

use async_trait::async_trait;
use futures::stream;
use serde_json::json;
use uuid::Uuid;

use super::{ChunkStream, LlmProvider, ProviderError};
use crate::models::llm::{ChatRequest, ChatResponse};

pub struct MockProvider {
    fixed_response: Option<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        MockProvider { fixed_response: None }
    }

    pub fn with_fixed_response(response: &str) -> Self {
        MockProvider { fixed_response: Some(response.to_string()) }
    }

    fn generate_response(&self, request: &ChatRequest) -> String {
        if let Some(fixed) = &self.fixed_response {
            return fixed.clone();
        }
        let user_message = request
            .messages
            .iter()
            .filter(|m| m.role == "user")
            .last()
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if user_message.len() > 50 {
            format!("This is a mock response to: '{}...'", &user_message[..50])
        } else {
            format!("This is a mock response to: '{}'", user_message)
        }
    }

    fn estimate_tokens(text: &str) -> u32 {
        (text.split_whitespace().count() as f64 * 1.3) as u32
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn supports_model(&self, model: &str) -> bool {
        model == "test-model" || model.starts_with("mock-")
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        _api_key: Option<&str>,
    ) -> Result<ChatResponse, ProviderError> {
        let content = self.generate_response(request);
        let input_text: String = request
            .messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        Ok(ChatResponse {
            id: format!("mock-{}", Uuid::new_v4().simple()),
            model: request.model.clone(),
            content: content.clone(),
            input_tokens: Self::estimate_tokens(&input_text).max(1),
            output_tokens: Self::estimate_tokens(&content).max(1),
            finish_reason: "stop".to_string(),
        })
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        api_key: Option<&str>,
    ) -> Result<ChunkStream, ProviderError> {
        let response = self.chat(request, api_key).await?;

        let mut chunks: Vec<Result<String, ProviderError>> = response
            .content
            .split_whitespace()
            .map(|word| {
                Ok(json!({
                    "choices": [{
                        "delta": {"content": format!("{} ", word)},
                        "index": 0,
                    }]
                })
                .to_string())
            })
            .collect();

        chunks.push(Ok(json!({
            "choices": [{
                "delta": {},
                "finish_reason": "stop",
                "index": 0,
            }]
        })
        .to_string()));

        Ok(Box::pin(stream::iter(chunks)))
    }
}
