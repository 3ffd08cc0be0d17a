//! Anthropic messages provider.
//!
//! Translates between wire protocols: the system message is lifted out of
//! the messages array into the top-level `system` field, and streaming
//! `content_block_delta` events become canonical OpenAI-shaped chunks with
//! a terminal `finish_reason` chunk at `message_stop`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::{json, Value};

use super::http::{check_status, map_send_error, stream_client, sync_client};
use super::sse::{data_payload, LineBuffer};
use super::{ChunkStream, LlmProvider, ProviderError};
use crate::models::llm::{ChatMessage, ChatRequest, ChatResponse};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_TOKENS: u32 = 4096;
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    base_url: String,
    client: ClientWithMiddleware,
    streaming: ClientWithMiddleware,
}

impl AnthropicProvider {
    pub fn new(base_url: Option<String>) -> Self {
        AnthropicProvider {
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            client: sync_client(DEFAULT_TIMEOUT_SECS),
            streaming: stream_client(DEFAULT_TIMEOUT_SECS),
        }
    }

    /// Anthropic carries the system prompt separately from the turn list.
    fn convert_messages(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
        let mut system = None;
        let mut turns = vec![];
        for msg in messages {
            if msg.role == "system" {
                system = Some(msg.content.clone());
            } else {
                turns.push(json!({"role": msg.role, "content": msg.content}));
            }
        }
        (system, turns)
    }

    fn build_payload(request: &ChatRequest, stream: bool) -> Value {
        let (system, messages) = Self::convert_messages(&request.messages);
        let mut payload = json!({
            "model": request.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if let Some(system) = system {
            payload["system"] = json!(system);
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
        let mut content = String::new();
        for block in data["content"].as_array().unwrap_or(&vec![]) {
            if block["type"] == "text" {
                content.push_str(block["text"].as_str().unwrap_or(""));
            }
        }
        let usage = &data["usage"];
        Ok(ChatResponse {
            id: data["id"]
                .as_str()
                .ok_or_else(|| ProviderError::Malformed("missing id".into()))?
                .to_string(),
            model: data["model"].as_str().unwrap_or("unknown").to_string(),
            content,
            input_tokens: usage["input_tokens"].as_u64().unwrap_or(0) as u32,
            output_tokens: usage["output_tokens"].as_u64().unwrap_or(0) as u32,
            finish_reason: map_stop_reason(data["stop_reason"].as_str()),
        })
    }
}

fn map_stop_reason(reason: Option<&str>) -> String {
    match reason {
        Some("max_tokens") => "length".to_string(),
        Some("tool_use") => "tool_calls".to_string(),
        _ => "stop".to_string(),
    }
}

/// Translate one Anthropic streaming event into a canonical chunk.
///
/// Returns `Translated::Chunk` for content deltas, `Translated::Done` (with
/// a terminal chunk) at `message_stop`, and `Translated::Skip` for every
/// other event type.
enum Translated {
    Chunk(String),
    Done(String),
    Skip,
}

fn translate_event(event: &Value, finish_reason: &mut String) -> Translated {
    match event["type"].as_str() {
        Some("content_block_delta") => {
            let delta = &event["delta"];
            if delta["type"] == "text_delta" {
                let chunk = json!({
                    "choices": [{
                        "delta": {"content": delta["text"].as_str().unwrap_or("")},
                        "index": 0,
                    }]
                });
                Translated::Chunk(chunk.to_string())
            } else {
                Translated::Skip
            }
        }
        Some("message_delta") => {
            if let Some(reason) = event["delta"]["stop_reason"].as_str() {
                *finish_reason = map_stop_reason(Some(reason));
            }
            Translated::Skip
        }
        Some("message_stop") => {
            let terminal = json!({
                "choices": [{
                    "delta": {},
                    "finish_reason": finish_reason.clone(),
                    "index": 0,
                }]
            });
            Translated::Done(terminal.to_string())
        }
        _ => Translated::Skip,
    }
}

#[async_trait]
impl LlmProvider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn supports_model(&self, model: &str) -> bool {
        model.starts_with("claude-")
    }

    async fn chat(
        &self,
        request: &ChatRequest,
        api_key: Option<&str>,
    ) -> Result<ChatResponse, ProviderError> {
        let api_key = api_key.ok_or_else(|| ProviderError::MissingApiKey("anthropic".into()))?;

        let resp = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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
        let api_key = api_key.ok_or_else(|| ProviderError::MissingApiKey("anthropic".into()))?;

        let resp = self
            .streaming
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&Self::build_payload(request, true))
            .send()
            .await
            .map_err(map_send_error)?;
        let resp = check_status(resp).await?;

        let bytes = resp.bytes_stream();
        let state = (bytes, LineBuffer::new(), "stop".to_string(), false);
        let stream = futures::stream::try_unfold(
            state,
            |(mut bytes, mut buffer, mut finish_reason, done)| async move {
                if done {
                    return Ok(None);
                }
                loop {
                    if let Some(line) = buffer.next_line() {
                        let Some(payload) = data_payload(&line) else {
                            continue;
                        };
                        let Ok(event) = serde_json::from_str::<Value>(payload) else {
                            continue;
                        };
                        match translate_event(&event, &mut finish_reason) {
                            Translated::Chunk(chunk) => {
                                return Ok(Some((chunk, (bytes, buffer, finish_reason, false))));
                            }
                            Translated::Done(terminal) => {
                                return Ok(Some((terminal, (bytes, buffer, finish_reason, true))));
                            }
                            Translated::Skip => continue,
                        }
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

    #[test]
    fn test_supported_models() {
        let p = AnthropicProvider::new(None);
        assert!(p.supports_model("claude-3-opus"));
        assert!(p.supports_model("claude-3-5-sonnet-20241022"));
        assert!(!p.supports_model("gpt-4o"));
    }

    #[test]
    fn test_system_message_lifted() {
        let request = ChatRequest {
            model: "claude-3-opus".into(),
            messages: vec![ChatMessage::system("be terse"), ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
            stream: false,
        };
        let payload = AnthropicProvider::build_payload(&request, false);
        assert_eq!(payload["system"], "be terse");
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_max_tokens_defaulted() {
        let request = ChatRequest {
            model: "claude-3-opus".into(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
            stream: false,
        };
        let payload = AnthropicProvider::build_payload(&request, false);
        assert_eq!(payload["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn test_parse_response_concatenates_text_blocks() {
        let data = json!({
            "id": "msg_1",
            "model": "claude-3-opus",
            "content": [
                {"type": "text", "text": "Hello"},
                {"type": "text", "text": " world"},
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4},
            "stop_reason": "end_turn",
        });
        let resp = AnthropicProvider::parse_response(data).unwrap();
        assert_eq!(resp.content, "Hello world");
        assert_eq!(resp.input_tokens, 10);
        assert_eq!(resp.finish_reason, "stop");
    }

    #[test]
    fn test_stop_reason_mapping() {
        assert_eq!(map_stop_reason(Some("end_turn")), "stop");
        assert_eq!(map_stop_reason(Some("max_tokens")), "length");
        assert_eq!(map_stop_reason(Some("tool_use")), "tool_calls");
        assert_eq!(map_stop_reason(None), "stop");
    }

    #[test]
    fn test_translate_content_block_delta() {
        let mut finish = "stop".to_string();
        let event = json!({
            "type": "content_block_delta",
            "delta": {"type": "text_delta", "text": "Hi"},
        });
        let Translated::Chunk(chunk) = translate_event(&event, &mut finish) else {
            panic!("expected chunk");
        };
        let parsed: Value = serde_json::from_str(&chunk).unwrap();
        assert_eq!(parsed["choices"][0]["delta"]["content"], "Hi");
    }

    #[test]
    fn test_translate_message_stop_emits_terminal_chunk() {
        let mut finish = "stop".to_string();
        let event = json!({"type": "message_stop"});
        let Translated::Done(terminal) = translate_event(&event, &mut finish) else {
            panic!("expected terminal chunk");
        };
        let parsed: Value = serde_json::from_str(&terminal).unwrap();
        assert_eq!(parsed["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn test_translate_carries_stop_reason_from_message_delta() {
        let mut finish = "stop".to_string();
        let delta = json!({"type": "message_delta", "delta": {"stop_reason": "max_tokens"}});
        assert!(matches!(translate_event(&delta, &mut finish), Translated::Skip));

        let stop = json!({"type": "message_stop"});
        let Translated::Done(terminal) = translate_event(&stop, &mut finish) else {
            panic!("expected terminal chunk");
        };
        let parsed: Value = serde_json::from_str(&terminal).unwrap();
        assert_eq!(parsed["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn test_translate_skips_other_events() {
        let mut finish = "stop".to_string();
        for event_type in ["message_start", "content_block_start", "content_block_stop", "ping"] {
            let event = json!({"type": event_type});
            assert!(matches!(translate_event(&event, &mut finish), Translated::Skip));
        }
    }
}
