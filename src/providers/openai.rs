//! OpenAI chat-completions provider.
//!
//! Its wire format is the canonical one, so streaming passes `data:`
//! payloads through unchanged (minus the `[DONE]` marker, which the
//! consumer re-frames).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};

use super::http::{check_status, map_send_error, stream_client, sync_client};
use super::sse::{data_payload, LineBuffer};
use super::{ChunkStream, LlmProvider, ProviderError};
use crate::models::llm::{ChatRequest, ChatResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

pub struct OpenAiProvider {
    base_url: String,
    client: ClientWithMiddleware,
    streaming: ClientWithMiddleware,
}

impl OpenAiProvider {
    pub fn new(base_url: Option<String>) -> Self {
        OpenAiProvider {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: sync_client(DEFAULT_TIMEOUT_SECS),
            streaming: stream_client(DEFAULT_TIMEOUT_SECS),
        }
    }

    fn build_payload(request: &ChatRequest, stream: bool) -> Value {
        let mut payload = json!({
            "model": request.model,
            "messages": request.messages.iter().map(|m| json!({
                "role": m.role,
                "content": m.content,
            })).collect::<Vec<_>>(),
        });
        if let Some(max_tokens) = request.max_tokens {
            payload["max_tokens"] = json!(max_tokens);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if stream {
            payload["stream"] = json!(true);
        }
        payload
    }

    fn parse_response(data: Value) -> Result<ChatResponse, ProviderError> {
        let choice = data["choices"]
            .get(0)
            .ok_or_else(|| ProviderError::Malformed("missing choices".into()))?;
        let content = choice["message"]["content"].as_str().unwrap_or("").to_string();
        let usage = &data["usage"];

        Ok(ChatResponse {
            id: data["id"].as_str().unwrap_or("unknown").to_string(),
            model: data["model"].as_str().unwrap_or("unknown").to_string(),
            content,
            input_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            finish_reason: choice["finish_reason"].as_str().unwrap_or("stop").to_string(),
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("gpt-")
            || model.starts_with("o1")
            || model.starts_with("o3")
            || model == "chatgpt-4o-latest"
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        api_key: Option<&str>,
    ) -> Result<ChatResponse, ProviderError> {
        let api_key = api_key.ok_or_else(|| ProviderError::MissingApiKey("openai".into()))?;

        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
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
        api_key: Option<&str>,
    ) -> Result<ChunkStream, ProviderError> {
        let api_key = api_key.ok_or_else(|| ProviderError::MissingApiKey("openai".into()))?;

        let resp = self
            .streaming
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::llm::ChatMessage;

    #[test]
    fn test_supported_models() {
        let p = OpenAiProvider::new(None);
        assert!(p.supports_model("gpt-4o"));
        assert!(p.supports_model("gpt-3.5-turbo"));
        assert!(p.supports_model("o1-mini"));
        assert!(p.supports_model("o3"));
        assert!(p.supports_model("chatgpt-4o-latest"));
        assert!(!p.supports_model("claude-3-opus"));
        assert!(!p.supports_model("llama3"));
    }

    #[test]
    fn test_payload_shape() {
        let request = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: Some(100),
            temperature: Some(0.7),
            stream: false,
        };
        let payload = OpenAiProvider::build_payload(&request, true);
        assert_eq!(payload["model"], "gpt-4o");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["max_tokens"], 100);
        assert_eq!(payload["stream"], true);
    }

    #[test]
    fn test_optional_fields_omitted() {
        let request = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            max_tokens: None,
            temperature: None,
            stream: false,
        };
        let payload = OpenAiProvider::build_payload(&request, false);
        assert!(payload.get("max_tokens").is_none());
        assert!(payload.get("temperature").is_none());
        assert!(payload.get("stream").is_none());
    }

    #[test]
    fn test_parse_response() {
        let data = serde_json::json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "choices": [{"message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3},
        });
        let resp = OpenAiProvider::parse_response(data).unwrap();
        assert_eq!(resp.content, "hello");
        assert_eq!(resp.input_tokens, 12);
        assert_eq!(resp.output_tokens, 3);
        assert_eq!(resp.finish_reason, "stop");
    }

    #[test]
    fn test_parse_response_missing_choices() {
        let err = OpenAiProvider::parse_response(serde_json::json!({"id": "x"})).unwrap_err();
        assert!(matches!(err, ProviderError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_chat_requires_api_key() {
        let p = OpenAiProvider::new(None);
        let request = ChatRequest {
            model: "gpt-4o".into(),
            messages: vec![],
            max_tokens: None,
            temperature: None,
            stream: false,
        };
        let err = p.chat(&request, None).await.unwrap_err();
        assert!(matches!(err, ProviderError::MissingApiKey(_)));
    }
}
