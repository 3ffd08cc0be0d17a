//! Ports: the storage and side-effect interfaces the pipeline depends on.
//!
//! Implementations live in `store::postgres` (production) and
//! `store::memory` (tests, local development). All ports are async and safe
//! for concurrent use.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::models::app::{ApiCredential, ResolvedCredentials};
use crate::models::audit::AuditEntry;
use crate::models::budget::Budget;
use crate::models::feature::{AppFeatureRegistry, FeatureDefinition};
use crate::models::llm::UsageRecord;
use crate::models::policy::PolicyRule;
use crate::models::trace::{RequestTrace, TraceDecision, TraceStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Other(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StoreError::Unavailable(e.to_string())
            }
            other => StoreError::Other(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PolicyRepository: Send + Sync {
    /// Enabled rules whose `application_id` is null or equals the app,
    /// ordered by priority descending. `environment` additionally filters by
    /// the rules' environment condition.
    async fn get_active_rules(
        &self,
        org_id: Option<&str>,
        app_id: Option<&str>,
        environment: Option<&str>,
    ) -> StoreResult<Vec<PolicyRule>>;

    async fn create(&self, rule: &PolicyRule) -> StoreResult<()>;
    async fn update(&self, rule: &PolicyRule) -> StoreResult<()>;
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<PolicyRule>>;
}

#[async_trait]
pub trait BudgetRepository: Send + Sync {
    /// All applicable budgets, user → org → app (most specific first), with
    /// feature/environment filters applied and period resets performed.
    async fn get_budgets_for_app(
        &self,
        app_id: &str,
        org_id: Option<&str>,
        user_email: Option<&str>,
        feature: Option<&str>,
        environment: &str,
    ) -> StoreResult<Vec<Budget>>;

    /// Atomically add `delta` to the budget's spend, resetting the period
    /// first when it elapsed. Called only after a successful provider
    /// response with actual costs.
    async fn record_usage(&self, budget_id: Uuid, delta: Decimal) -> StoreResult<()>;

    async fn create(&self, budget: &Budget) -> StoreResult<()>;
    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Budget>>;
    async fn delete(&self, id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait FeatureRegistryRepository: Send + Sync {
    /// Full registry snapshot for an application, or None when the app has
    /// never declared features (⇒ permissive).
    async fn registry_for_app(&self, app_id: &str) -> StoreResult<Option<AppFeatureRegistry>>;

    async fn register_feature(&self, app_id: &str, feature: FeatureDefinition) -> StoreResult<()>;
    async fn remove_feature(&self, app_id: &str, feature_id: &str) -> StoreResult<bool>;
    async fn get_feature(
        &self,
        app_id: &str,
        feature_id: &str,
    ) -> StoreResult<Option<FeatureDefinition>>;
    async fn list_features(&self, app_id: &str) -> StoreResult<Vec<FeatureDefinition>>;
    async fn set_strict_mode(&self, app_id: &str, strict: bool) -> StoreResult<()>;
    async fn set_default_feature(&self, app_id: &str, feature_id: Option<&str>) -> StoreResult<()>;
}

/// A freshly created credential: the row plus the plaintext key, which is
/// returned exactly once and never stored.
pub struct CreatedCredential {
    pub credential: ApiCredential,
    pub plaintext_key: String,
}

#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn lookup_by_key_hash(&self, key_hash: &str) -> StoreResult<Option<ResolvedCredentials>>;
    async fn create(
        &self,
        app_id: &str,
        name: &str,
        environment: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<CreatedCredential>;
    /// Creates a replacement credential and deactivates the old one.
    async fn rotate(&self, credential_id: i64) -> StoreResult<CreatedCredential>;
    async fn deactivate(&self, credential_id: i64) -> StoreResult<bool>;
    async fn delete(&self, credential_id: i64) -> StoreResult<bool>;
    /// Best-effort; a write failure must not fail authentication.
    async fn touch_last_used(&self, credential_id: i64) -> StoreResult<()>;
}

#[async_trait]
pub trait AuditLogRepository: Send + Sync {
    async fn log(&self, entry: &AuditEntry) -> StoreResult<()>;
    async fn by_request_id(&self, request_id: &str) -> StoreResult<Vec<AuditEntry>>;
    async fn by_app(&self, app_id: &str, limit: i64) -> StoreResult<Vec<AuditEntry>>;
    async fn list_blocked(&self, limit: i64) -> StoreResult<Vec<AuditEntry>>;
    async fn count_errors(&self, since: DateTime<Utc>) -> StoreResult<i64>;
    async fn cleanup_old_logs(&self, retention_days: i64) -> StoreResult<u64>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    /// Insert-or-no-op keyed by `request_id`. Returns false when the row
    /// already existed (idempotent replay — must not double-bill).
    async fn record(&self, usage: &UsageRecord) -> StoreResult<bool>;
    async fn get_total_cost(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
        feature: Option<&str>,
        environment: Option<&str>,
    ) -> StoreResult<Decimal>;
    async fn list_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UsageRecord>>;
    /// `(model, total_cost, request_count)` per model for an app.
    async fn stats_by_model(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>>;
    /// `(feature, total_cost, request_count)` per feature for an app.
    /// Records without a feature aggregate under the empty string.
    async fn stats_by_feature(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>>;
    async fn daily_stats(&self, app_id: &str, days: i64) -> StoreResult<Vec<(String, Decimal, i64)>>;
}

#[async_trait]
pub trait RequestTracing: Send + Sync {
    async fn create_trace(&self, trace: &RequestTrace) -> StoreResult<Uuid>;
    async fn start_span(&self, trace_id: Uuid, step: &str, payload: Option<Value>) -> StoreResult<()>;
    async fn end_span(
        &self,
        trace_id: Uuid,
        step: &str,
        status: &str,
        payload: Option<Value>,
        error: Option<&str>,
    ) -> StoreResult<()>;
    async fn complete_trace(
        &self,
        trace_id: Uuid,
        decision: TraceDecision,
        final_data: Value,
    ) -> StoreResult<()>;
    async fn fail_trace(
        &self,
        trace_id: Uuid,
        error: &str,
        step: &str,
        status: TraceStatus,
        estimated_cost_avoided: Decimal,
    ) -> StoreResult<()>;
    async fn get_trace(&self, trace_id: Uuid) -> StoreResult<Option<RequestTrace>>;
    async fn list_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<RequestTrace>>;
}

/// Cross-request abuse detection. Optional: when no detector is configured
/// the pipeline passes straight through.
#[derive(Debug, Clone)]
pub struct AbuseCheck {
    pub blocked: bool,
    pub reason: Option<String>,
    pub abuse_type: Option<String>,
    pub cooldown_seconds: Option<u64>,
}

#[async_trait]
pub trait AbuseDetector: Send + Sync {
    async fn check_request(
        &self,
        app_id: &str,
        feature: &str,
        model: &str,
        request_id: &str,
    ) -> AbuseCheck;
}

/// Decrypts `enc:`-prefixed passthrough provider keys.
#[async_trait]
pub trait Encryption: Send + Sync {
    async fn decrypt_api_key(&self, ciphertext: &str) -> anyhow::Result<String>;
}

/// Non-blocking observability hooks. Implementations must never fail the
/// request path.
pub trait MetricsSink: Send + Sync {
    fn request_started(&self, app_id: &str);
    fn request_finished(&self, app_id: &str);
    fn record_request(
        &self,
        app_id: &str,
        model: &str,
        status: &str,
        latency_seconds: f64,
        input_tokens: u32,
        output_tokens: u32,
        cost_usd: Decimal,
    );
    fn record_decision(&self, app_id: &str, decision: &str, source: &str);
    fn record_error(&self, app_id: &str, kind: &str);
    fn record_timeout(&self, app_id: &str, model: &str);
}

/// No-op sink for tests and minimal deployments.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn request_started(&self, _app_id: &str) {}
    fn request_finished(&self, _app_id: &str) {}
    fn record_request(
        &self,
        _app_id: &str,
        _model: &str,
        _status: &str,
        _latency_seconds: f64,
        _input_tokens: u32,
        _output_tokens: u32,
        _cost_usd: Decimal,
    ) {
    }
    fn record_decision(&self, _app_id: &str, _decision: &str, _source: &str) {}
    fn record_error(&self, _app_id: &str, _kind: &str) {}
    fn record_timeout(&self, _app_id: &str, _model: &str) {}
}
