//! Explainable decision making.
//!
//! Aggregates the verdicts of every sub-engine into a single decision with
//! an ordered chain, a primary reason, and non-blocking warnings. Codes are
//! stable strings — they appear in audit logs and API responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Instant;
use uuid::Uuid;

/// Pipeline stages that can contribute a sub-decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStage {
    Authentication,
    Authorization,
    FeatureCheck,
    PolicyCheck,
    BudgetCheck,
    SecurityCheck,
    AbuseCheck,
    InputValidation,
    RateLimit,
    OutputValidation,
    LlmCall,
}

impl DecisionStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionStage::Authentication => "authentication",
            DecisionStage::Authorization => "authorization",
            DecisionStage::FeatureCheck => "feature_check",
            DecisionStage::PolicyCheck => "policy_check",
            DecisionStage::BudgetCheck => "budget_check",
            DecisionStage::SecurityCheck => "security_check",
            DecisionStage::AbuseCheck => "abuse_check",
            DecisionStage::InputValidation => "input_validation",
            DecisionStage::RateLimit => "rate_limit",
            DecisionStage::OutputValidation => "output_validation",
            DecisionStage::LlmCall => "llm_call",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionOutcome {
    Allow,
    Warn,
    Deny,
    Block,
    Error,
}

impl DecisionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionOutcome::Allow => "allow",
            DecisionOutcome::Warn => "warn",
            DecisionOutcome::Deny => "deny",
            DecisionOutcome::Block => "block",
            DecisionOutcome::Error => "error",
        }
    }

    pub fn is_blocking(&self) -> bool {
        matches!(self, DecisionOutcome::Deny | DecisionOutcome::Block | DecisionOutcome::Error)
    }
}

/// Stable decision codes.
pub mod codes {
    pub const AUTH_MISSING_KEY: &str = "AUTH_MISSING_KEY";
    pub const AUTH_INVALID_KEY: &str = "AUTH_INVALID_KEY";
    pub const AUTH_EXPIRED_KEY: &str = "AUTH_EXPIRED_KEY";
    pub const AUTH_KEY_DISABLED: &str = "AUTH_KEY_DISABLED";

    pub const POLICY_MODEL_BLOCKED: &str = "POLICY_MODEL_BLOCKED";
    pub const POLICY_MAX_TOKENS_EXCEEDED: &str = "POLICY_MAX_TOKENS_EXCEEDED";
    pub const POLICY_OUTSIDE_ALLOWED_HOURS: &str = "POLICY_OUTSIDE_ALLOWED_HOURS";
    pub const POLICY_RULE_DENIED: &str = "POLICY_RULE_DENIED";
    pub const POLICY_RULE_WARNING: &str = "POLICY_RULE_WARNING";

    pub const BUDGET_HARD_LIMIT_EXCEEDED: &str = "BUDGET_HARD_LIMIT_EXCEEDED";
    pub const BUDGET_SOFT_LIMIT_WARNING: &str = "BUDGET_SOFT_LIMIT_WARNING";

    pub const SECURITY_PROMPT_INJECTION: &str = "SECURITY_PROMPT_INJECTION";
    pub const SECURITY_SENSITIVE_DATA: &str = "SECURITY_SENSITIVE_DATA";
    pub const SECURITY_INVALID_STRUCTURE: &str = "SECURITY_INVALID_STRUCTURE";

    pub const DENIED_ABUSE: &str = "DENIED_ABUSE";
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";
    pub const PROVIDER_TIMEOUT: &str = "PROVIDER_TIMEOUT";
    pub const SERVICE_UNAVAILABLE: &str = "SERVICE_UNAVAILABLE";
    pub const API_KEY_REQUIRED: &str = "API_KEY_REQUIRED";
    pub const DECRYPTION_FAILED: &str = "DECRYPTION_FAILED";
}

/// One sub-engine verdict in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubDecision {
    pub stage: DecisionStage,
    pub outcome: DecisionOutcome,
    pub code: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<String>,
    pub duration_ms: f64,
}

/// The full, explainable verdict for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: Uuid,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: DecisionOutcome,
    pub chain: Vec<SubDecision>,
    /// The first blocking entry, or the most severe one.
    pub primary_reason: Option<SubDecision>,
    pub warnings: Vec<SubDecision>,
    pub total_duration_ms: f64,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        matches!(self.outcome, DecisionOutcome::Allow | DecisionOutcome::Warn)
    }

    /// Chain serialised for the error envelope.
    pub fn chain_json(&self) -> Value {
        serde_json::to_value(&self.chain).unwrap_or(Value::Null)
    }
}

/// Builder collecting sub-decisions as the pipeline runs.
pub struct DecisionBuilder {
    request_id: String,
    started: Instant,
    started_at: DateTime<Utc>,
    chain: Vec<SubDecision>,
    outcome: Option<DecisionOutcome>,
    stage_started: Option<Instant>,
}

impl DecisionBuilder {
    pub fn new(request_id: &str) -> Self {
        DecisionBuilder {
            request_id: request_id.to_string(),
            started: Instant::now(),
            started_at: Utc::now(),
            chain: vec![],
            outcome: None,
            stage_started: None,
        }
    }

    /// Mark the start of a stage so the next recorded entry carries its
    /// duration.
    pub fn begin_stage(&mut self) {
        self.stage_started = Some(Instant::now());
    }

    fn stage_elapsed_ms(&mut self) -> f64 {
        let elapsed = self
            .stage_started
            .take()
            .map(|s| s.elapsed().as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        elapsed
    }

    fn push(
        &mut self,
        stage: DecisionStage,
        outcome: DecisionOutcome,
        code: &str,
        reason: &str,
        details: Value,
    ) {
        let duration_ms = self.stage_elapsed_ms();
        self.chain.push(SubDecision {
            stage,
            outcome,
            code: code.to_string(),
            reason: reason.to_string(),
            details,
            rule_id: None,
            policy_id: None,
            duration_ms,
        });
    }

    pub fn allow(&mut self, stage: DecisionStage, code: &str, reason: &str) {
        self.push(stage, DecisionOutcome::Allow, code, reason, Value::Null);
    }

    pub fn allow_with(&mut self, stage: DecisionStage, code: &str, reason: &str, details: Value) {
        self.push(stage, DecisionOutcome::Allow, code, reason, details);
    }

    pub fn warn(&mut self, stage: DecisionStage, code: &str, reason: &str) {
        self.push(stage, DecisionOutcome::Warn, code, reason, Value::Null);
        if self.outcome.is_none() || self.outcome == Some(DecisionOutcome::Allow) {
            self.outcome = Some(DecisionOutcome::Warn);
        }
    }

    pub fn deny(&mut self, stage: DecisionStage, code: &str, reason: &str) {
        self.push(stage, DecisionOutcome::Deny, code, reason, Value::Null);
        self.outcome = Some(DecisionOutcome::Deny);
    }

    pub fn block(&mut self, stage: DecisionStage, code: &str, reason: &str) {
        self.push(stage, DecisionOutcome::Block, code, reason, Value::Null);
        self.outcome = Some(DecisionOutcome::Block);
    }

    pub fn error(&mut self, stage: DecisionStage, code: &str, reason: &str) {
        self.push(stage, DecisionOutcome::Error, code, reason, Value::Null);
        self.outcome = Some(DecisionOutcome::Error);
    }

    /// Attach a rule/policy id to the most recent entry.
    pub fn with_rule(&mut self, rule_id: &str) {
        if let Some(last) = self.chain.last_mut() {
            last.rule_id = Some(rule_id.to_string());
        }
    }

    pub fn build(self) -> Decision {
        let outcome = self.outcome.unwrap_or(DecisionOutcome::Allow);

        let primary_reason = self
            .chain
            .iter()
            .find(|s| s.outcome.is_blocking())
            .or_else(|| self.chain.iter().find(|s| s.outcome == DecisionOutcome::Warn))
            .cloned();

        let warnings = self
            .chain
            .iter()
            .filter(|s| s.outcome == DecisionOutcome::Warn)
            .cloned()
            .collect();

        Decision {
            decision_id: Uuid::new_v4(),
            request_id: self.request_id,
            timestamp: self.started_at,
            outcome,
            chain: self.chain,
            primary_reason,
            warnings,
            total_duration_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        }
    }
}
