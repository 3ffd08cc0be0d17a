//! Local OpenAI-compatible providers: Ollama and LM-Studio.
//!
//! Both speak the canonical wire format, run without an upstream API key,
//! and get the longer local-call timeout.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};

use super::http::{check_status, map_send_error, stream_client, sync_client};
use super::sse::{data_payload, LineBuffer};
use super::{ChunkStream, LlmProvider, ProviderError};
use crate::models::llm::{ChatRequest, ChatResponse};

const OLLAMA_BASE_URL: &str = "http://localhost:11434";
const LMSTUDIO_BASE_URL: &str = "http://localhost:1234";
const LOCAL_TIMEOUT_SECS: u64 = 120;

/// Fixed family of local model name prefixes Ollama serves.
const LOCAL_MODEL_PREFIXES: &[&str] = &[
    "llama",
    "mistral",
    "mixtral",
    "codellama",
    "phi",
    "gemma",
    "qwen",
    "deepseek",
    "starcoder",
    "wizard",
    "neural-chat",
    "openchat",
    "orca",
    "vicuna",
    "zephyr",
    "dolphin",
    "nous-hermes",
    "solar",
    "yi",
    "falcon",
    "tinyllama",
    "granite",
    "codegemma",
];

pub struct OllamaProvider {
    name: &'static str,
    base_url: String,
    client: ClientWithMiddleware,
    streaming: ClientWithMiddleware,
}

impl OllamaProvider {
    pub fn new(base_url: Option<String>) -> Self {
        OllamaProvider {
            name: "ollama",
            base_url: base_url.unwrap_or_else(|| OLLAMA_BASE_URL.to_string()),
            client: sync_client(LOCAL_TIMEOUT_SECS),
            streaming: stream_client(LOCAL_TIMEOUT_SECS),
        }
    }

    /// LM-Studio variant: same protocol, selected by the explicit
    /// `lmstudio/` model prefix.
    pub fn lmstudio(base_url: Option<String>) -> Self {
        OllamaProvider {
            name: "lmstudio",
            base_url: base_url.unwrap_or_else(|| LMSTUDIO_BASE_URL.to_string()),
            client: sync_client(LOCAL_TIMEOUT_SECS),
            streaming: stream_client(LOCAL_TIMEOUT_SECS),
        }
    }

    fn build_payload(request: &ChatRequest, stream: bool) -> Value {
        // Strip the explicit provider prefix before sending upstream
        let mut model = request.model.as_str();
        for prefix in ["lmstudio/", "ollama/"] {
            if let Some(stripped) = model.strip_prefix(prefix) {
                model = stripped;
                break;
            }
        }

        let mut payload = json!({
            "model": model,
            "messages": request.messages.iter().map(|m| json!({
                "role": m.role,
                "content": m.content,
            })).collect::<Vec<_>>(),
            "stream": stream,
        });
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        payload
    }

    fn parse_response(data: Value) -> Result<ChatResponse, ProviderError> {
        let choice = data["choices"]
            .get(0)
            .ok_or_else(|| ProviderError::Malformed("missing choices".into()))?;
        let usage = &data["usage"];
        let model = data["model"].as_str().unwrap_or("unknown").to_string();

        Ok(ChatResponse {
            id: data["id"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| format!("ollama-{}", model)),
            model,
            content: choice["message"]["content"].as_str().unwrap_or("").to_string(),
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        })
    }

    fn supports_local_family(model: &str) -> bool {
        let lower = model.to_lowercase();
        if LOCAL_MODEL_PREFIXES.iter().any(|p| lower.starts_with(p)) {
            return true;
        }
        // Namespaced names like qwen/qwen2.5-coder match on either side
        if let Some((org, name)) = lower.split_once('/') {
            return LOCAL_MODEL_PREFIXES
                .iter()
                .any(|p| name.starts_with(p) || org.starts_with(p));
        }
        false
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports_model(&self, model: &str) -> bool {
        match self.name {
            "lmstudio" => model.starts_with("lmstudio/"),
            _ => Self::supports_local_family(model),
        }
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        _api_key: Option<&str>,
    ) -> Result<ChatResponse, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&Self::build_payload(request, false))
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = check_status(resp).await?;

        let data: Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Self::parse_response(data)
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        _api_key: Option<&str>,
    ) -> Result<ChunkStream, ProviderError> {
        let resp = self
            .streaming
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&Self::build_payload(request, true))
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = check_status(resp).await?;

        let bytes = resp.bytes_stream();
        let stream = futures::stream::try_unfold(
            (bytes, LineBuffer::new()),
            |(mut bytes, mut buffer)| async move {
                loop {
                    if let Some(line) = buffer.next_line() {
                        let Some(payload) = data_payload(&line) else {
                            continue;
                        };
                        if payload == "[DONE]" {
                            return Ok(None);
                        }
                        return Ok(Some((payload.to_string(), (bytes, buffer))));
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.push(&chunk),
                        Some(Err(e)) => return Err(ProviderError::Network(e.to_string())),
                        None => return Ok(None),
                    }
                }
            },
        );

        Ok(Box::pin(stream))
    }
}
