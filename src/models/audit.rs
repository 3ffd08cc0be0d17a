use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Append-only audit log entry. One row per governance decision worth
/// keeping; writes are best-effort and never fail the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub event_type: String,
    pub request_id: String,
    pub app_id: String,
    pub org_id: Option<String>,
    pub model: Option<String>,
    /// Policy action that applied, if any (`allow` / `warn` / `deny`).
    pub action: Option<String>,
    /// Request outcome (`allowed`, `denied_policy`, `denied_budget`, ...).
    pub outcome: String,
    pub details: Value,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
}

impl AuditEntry {
    pub fn llm_request(request_id: &str, app_id: &str, outcome: &str) -> Self {
        AuditEntry {
            id: Uuid::new_v4(),
            event_type: "llm_request".to_string(),
            request_id: request_id.to_string(),
            app_id: app_id.to_string(),
            org_id: None,
            model: None,
            action: None,
            outcome: outcome.to_string(),
            details: Value::Null,
            input_tokens: None,
            output_tokens: None,
            created_at: Utc::now(),
        }
    }
}
