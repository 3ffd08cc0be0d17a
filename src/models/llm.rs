use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        ChatMessage { role: "user".into(), content: content.into() }
    }

    pub fn system(content: &str) -> Self {
        ChatMessage { role: "system".into(), content: content.into() }
    }

    pub fn assistant(content: &str) -> Self {
        ChatMessage { role: "assistant".into(), content: content.into() }
    }
}

/// The internal chat request handed to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
}

/// The single internal response shape every provider wire format is
/// translated into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub model: String,
    pub embeddings: Vec<Vec<f32>>,
    pub total_tokens: u32,
}

/// Immutable ledger row committed once per successful request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub app_id: String,
    pub feature: Option<String>,
    pub environment: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: Decimal,
    pub latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Admission-control token estimate: roughly 4 characters per token, with a
/// floor so empty prompts still cost something.
pub fn estimate_input_tokens(messages: &[ChatMessage]) -> u32 {
    let total_chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (total_chars / 4).max(10) as u32
}
