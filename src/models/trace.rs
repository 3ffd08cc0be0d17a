use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Terminal or in-flight state of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceStatus {
    Pending,
    Success,
    Blocked,
    Error,
    Timeout,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Pending => "pending",
            TraceStatus::Success => "success",
            TraceStatus::Blocked => "blocked",
            TraceStatus::Error => "error",
            TraceStatus::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TraceStatus::Pending)
    }
}

/// The governance decision recorded on the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceDecision {
    Allow,
    Warn,
    Block,
    Degrade,
}

impl TraceDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceDecision::Allow => "allow",
            TraceDecision::Warn => "warn",
            TraceDecision::Block => "block",
            TraceDecision::Degrade => "degrade",
        }
    }
}

/// One sub-engine step inside a trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub step_name: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub payload: Option<Value>,
    pub error: Option<String>,
}

/// Persistent, span-structured record of a request's path through the
/// pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTrace {
    pub trace_id: Uuid,
    pub request_id: String,
    pub app_id: String,
    pub org_id: Option<String>,
    pub user_email: Option<String>,
    pub feature: Option<String>,
    pub environment: String,
    pub model: String,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: Option<DateTime<Utc>>,
    pub decision: Option<TraceDecision>,
    pub status: TraceStatus,
    pub decision_reasons: Vec<String>,
    pub risk_categories: Vec<String>,
    /// Non-zero iff the request was blocked before the provider call.
    pub estimated_cost_avoided: Decimal,
    pub spans: Vec<TraceSpan>,
}

impl RequestTrace {
    pub fn new(request_id: &str, app_id: &str, model: &str, environment: &str) -> Self {
        RequestTrace {
            trace_id: Uuid::new_v4(),
            request_id: request_id.to_string(),
            app_id: app_id.to_string(),
            org_id: None,
            user_email: None,
            feature: None,
            environment: environment.to_string(),
            model: model.to_string(),
            timestamp_start: Utc::now(),
            timestamp_end: None,
            decision: None,
            status: TraceStatus::Pending,
            decision_reasons: vec![],
            risk_categories: vec![],
            estimated_cost_avoided: Decimal::ZERO,
            spans: vec![],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_trace_is_pending() {
        let t = RequestTrace::new("req-1", "test-app", "gpt-4o", "development");
        assert_eq!(t.status, TraceStatus::Pending);
        assert!(!t.status.is_terminal());
        assert!(t.timestamp_end.is_none());
        assert_eq!(t.estimated_cost_avoided, Decimal::ZERO);
    }

    #[test]
    fn test_terminal_statuses() {
        for s in [
            TraceStatus::Success,
            TraceStatus::Blocked,
            TraceStatus::Error,
            TraceStatus::Timeout,
        ] {
            assert!(s.is_terminal());
        }
    }

    #[test]
    fn test_status_serde() {
        assert_eq!(serde_json::to_string(&TraceStatus::Timeout).unwrap(), "\"timeout\"");
        assert_eq!(serde_json::to_string(&TraceDecision::Block).unwrap(), "\"block\"");
    }
}
