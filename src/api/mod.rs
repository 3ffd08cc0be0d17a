//! Inbound HTTP surface: the LLM endpoints the core exposes.
//!
//! `POST /v1/chat/completions` and `POST /v1/embeddings`, plus health and
//! metrics. The handlers authenticate, build the pipeline command, and map
//! pipeline outcomes to HTTP via `AppError` — nothing else in the crate
//! knows about status codes.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use rust_decimal::prelude::ToPrimitive;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::Authenticator;
use crate::engine::decision::codes;
use crate::errors::AppError;
use crate::metrics::encode_metrics;
use crate::models::llm::ChatMessage;
use crate::pipeline::{
    EmbeddingsCommand, Pipeline, PipelineCommand, PipelineResult, RequestOutcome, StreamOutcome,
};

pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub auth: Authenticator,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_handler))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/embeddings", post(embeddings))
        .with_state(state)
}

async fn metrics_handler() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
        .into_response()
}

// ── Request bodies ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionBody {
    model: String,
    messages: Vec<ApiMessage>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    #[serde(default)]
    stream: bool,
    feature: Option<String>,
    user: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingInput {
    Single(String),
    Batch(Vec<String>),
}

#[derive(Debug, Deserialize)]
struct EmbeddingsBody {
    model: String,
    input: EmbeddingInput,
    #[allow(dead_code)]
    encoding_format: Option<String>,
}

// ── Header helpers ───────────────────────────────────────────

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    header_str(headers, "authorization")?.strip_prefix("Bearer ")
}

fn request_id(headers: &HeaderMap) -> String {
    header_str(headers, "x-request-id")
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn dry_run_requested(headers: &HeaderMap) -> bool {
    matches!(header_str(headers, "x-dry-run"), Some("true") | Some("1"))
}

// ── Chat completions ─────────────────────────────────────────

async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionBody>,
) -> Result<Response, AppError> {
    if body.model.is_empty() {
        return Err(AppError::Contract("'model' is required".into()));
    }
    if body.messages.is_empty() {
        return Err(AppError::Contract("'messages' must not be empty".into()));
    }

    let creds = state
        .auth
        .authenticate(header_str(&headers, "x-api-key"), bearer(&headers))
        .await
        .map_err(|e| AppError::Auth { code: e.code(), message: e.to_string() })?;

    let command = PipelineCommand {
        request_id: request_id(&headers),
        app_id: creds.app_id.clone(),
        org_id: None,
        user_email: body.user.clone(),
        model: body.model.clone(),
        messages: body
            .messages
            .iter()
            .map(|m| ChatMessage { role: m.role.clone(), content: m.content.clone() })
            .collect(),
        environment: creds.environment.clone(),
        feature: body.feature.clone(),
        max_tokens: body.max_tokens,
        temperature: body.temperature,
        stream: body.stream,
        dry_run: dry_run_requested(&headers),
        api_key: creds.provider_api_key.clone(),
        allowed_models: creds.allowed_models.clone(),
    };

    if body.stream && !command.dry_run {
        return match state.pipeline.execute_stream(command).await {
            StreamOutcome::Denied(result) => Err(result_to_error(*result)),
            StreamOutcome::Stream { stream, .. } => Ok(sse_response(stream)),
        };
    }

    let result = state.pipeline.execute(command).await;
    match result.outcome {
        RequestOutcome::Allowed => Ok(Json(chat_response_body(&result)).into_response()),
        RequestOutcome::DryRun => Ok(Json(dry_run_body(&result)).into_response()),
        _ => Err(result_to_error(result)),
    }
}

fn sse_response(
    stream: impl futures::Stream<Item = Result<String, crate::providers::ProviderError>>
        + Send
        + 'static,
) -> Response {
    let framed = stream
        .map(|chunk| {
            chunk.map(|data| bytes::Bytes::from(format!("data: {}\n\n", data)))
        })
        .chain(futures::stream::once(async {
            Ok(bytes::Bytes::from("data: [DONE]\n\n"))
        }));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(framed))
        .expect("static response construction")
}

fn chat_response_body(result: &PipelineResult) -> Value {
    let response = result.response.as_ref().expect("allowed result has a response");
    let mut body = json!({
        "id": response.id,
        "object": "chat.completion",
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": response.content},
            "finish_reason": response.finish_reason,
        }],
        "usage": {
            "prompt_tokens": response.input_tokens,
            "completion_tokens": response.output_tokens,
            "total_tokens": response.input_tokens + response.output_tokens,
        },
    });

    // Security findings ride the envelope; detection never blocks
    if let Some(security) = &result.security {
        if !security.safe {
            body["security"] = json!({
                "risk_level": security.risk_level.as_str(),
                "risk_score": security.risk_score,
                "findings": security.findings.iter().map(|f| json!({
                    "category": f.category,
                    "severity": f.severity.as_str(),
                    "description": f.description,
                })).collect::<Vec<_>>(),
            });
        }
    }
    if !result.decision.warnings.is_empty() {
        body["warnings"] = json!(result
            .decision
            .warnings
            .iter()
            .map(|w| json!({"code": w.code, "message": w.reason}))
            .collect::<Vec<_>>());
    }
    body
}

fn dry_run_body(result: &PipelineResult) -> Value {
    let report = result.dry_run.as_ref().expect("dry-run result has a report");
    json!({
        "dry_run": true,
        "request_id": result.request_id,
        "would_be_allowed": report.would_be_allowed,
        "estimated_cost_usd": report.estimated_cost_usd.to_f64(),
        "policy_action": report.policy_action.as_str(),
        "budget_remaining_usd": report.budget_remaining_usd.and_then(|d| d.to_f64()),
        "budget_usage_percent": report.budget_usage_percent,
        "warnings": result.decision.warnings.iter()
            .map(|w| json!({"code": w.code, "message": w.reason}))
            .collect::<Vec<_>>(),
    })
}

/// The single mapping from pipeline outcomes to HTTP errors.
fn result_to_error(result: PipelineResult) -> AppError {
    let code = result
        .error_code
        .clone()
        .unwrap_or_else(|| "INTERNAL_ERROR".to_string());
    let message = result
        .error_message
        .clone()
        .unwrap_or_else(|| "request denied".to_string());
    let chain = result.decision.chain_json();

    match result.outcome {
        RequestOutcome::DeniedFeature => AppError::FeatureDenied {
            code,
            message,
            decision_chain: chain,
        },
        RequestOutcome::DeniedPolicy => AppError::PolicyDenied {
            code,
            message,
            decision_chain: chain,
        },
        RequestOutcome::DeniedBudget => AppError::BudgetDenied {
            code,
            message,
            decision_chain: chain,
        },
        RequestOutcome::DeniedAbuse => AppError::AbuseDenied {
            message,
            cooldown_seconds: result.cooldown_seconds,
        },
        _ => match code.as_str() {
            codes::PROVIDER_TIMEOUT => AppError::ProviderTimeout,
            codes::SERVICE_UNAVAILABLE => AppError::ServiceUnavailable(message),
            codes::API_KEY_REQUIRED | codes::DECRYPTION_FAILED => AppError::Contract(message),
            _ => AppError::Provider(message),
        },
    }
}

// ── Embeddings ───────────────────────────────────────────────

async fn embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EmbeddingsBody>,
) -> Result<Response, AppError> {
    if body.model.is_empty() {
        return Err(AppError::Contract("'model' is required".into()));
    }
    let input = match body.input {
        EmbeddingInput::Single(text) => vec![text],
        EmbeddingInput::Batch(items) => items,
    };
    if input.is_empty() {
        return Err(AppError::Contract("'input' must not be empty".into()));
    }

    let creds = state
        .auth
        .authenticate(header_str(&headers, "x-api-key"), bearer(&headers))
        .await
        .map_err(|e| AppError::Auth { code: e.code(), message: e.to_string() })?;

    let command = EmbeddingsCommand {
        request_id: request_id(&headers),
        app_id: creds.app_id.clone(),
        org_id: None,
        user_email: None,
        model: body.model.clone(),
        input,
        environment: creds.environment.clone(),
        feature: None,
        api_key: creds.provider_api_key.clone(),
        allowed_models: creds.allowed_models.clone(),
    };

    let result = state.pipeline.execute_embeddings(command).await;
    match result.outcome {
        RequestOutcome::Allowed => {
            let response = result.response.expect("allowed result has a response");
            Ok(Json(json!({
                "object": "list",
                "model": response.model,
                "data": response.embeddings.iter().enumerate().map(|(index, embedding)| json!({
                    "object": "embedding",
                    "index": index,
                    "embedding": embedding,
                })).collect::<Vec<_>>(),
                "usage": {"total_tokens": response.total_tokens},
            }))
            .into_response())
        }
        outcome => {
            let code = result.error_code.unwrap_or_else(|| "INTERNAL_ERROR".into());
            let message = result.error_message.unwrap_or_else(|| "request denied".into());
            let chain = result.decision.chain_json();
            Err(match outcome {
                RequestOutcome::DeniedFeature => {
                    AppError::FeatureDenied { code, message, decision_chain: chain }
                }
                RequestOutcome::DeniedPolicy => {
                    AppError::PolicyDenied { code, message, decision_chain: chain }
                }
                RequestOutcome::DeniedBudget => {
                    AppError::BudgetDenied { code, message, decision_chain: chain }
                }
                _ => match code.as_str() {
                    codes::PROVIDER_TIMEOUT => AppError::ProviderTimeout,
                    codes::SERVICE_UNAVAILABLE => AppError::ServiceUnavailable(message),
                    codes::API_KEY_REQUIRED => AppError::Contract(message),
                    _ => AppError::Provider(message),
                },
            })
        }
    }
}
