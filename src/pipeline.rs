//! The request-evaluation pipeline.
//!
//! One request runs linearly through: trace creation → abuse check →
//! feature check → policy evaluation → security analysis → budget check →
//! dry-run exit → key resolution → provider call → ledger update → trace
//! close. The first deny short-circuits; remaining spans are never opened.
//! Sub-engines return structured results — the orchestrator is the only
//! component that converts them into a terminal outcome.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::Stream;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use uuid::Uuid;

use crate::engine::budget::{BudgetChecker, BudgetStatus};
use crate::engine::decision::{codes, Decision, DecisionBuilder, DecisionStage};
use crate::engine::features::{check_feature, FeatureCheckResult};
use crate::engine::policy::{PolicyDecision, PolicyEvaluator};
use crate::engine::security::{SecurityGuard, SecurityResult};
use crate::engine::conditions::ConditionContext;
use crate::failsafe::FailsafeSet;
use crate::models::audit::AuditEntry;
use crate::models::budget::Budget;
use crate::models::feature::FeatureAction;
use crate::models::llm::{estimate_input_tokens, ChatMessage, ChatRequest, ChatResponse, UsageRecord};
use crate::models::policy::PolicyAction;
use crate::models::trace::{RequestTrace, TraceDecision, TraceStatus};
use crate::ports::{
    AbuseDetector, AuditLogRepository, BudgetRepository, Encryption, FeatureRegistryRepository,
    MetricsSink, PolicyRepository, RequestTracing, StoreError, UsageRepository,
};
use crate::providers::{is_local_provider, ChunkStream, LlmProvider, ProviderError, ProviderRegistry};

const DEFAULT_PROVIDER_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_LOCAL_PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 1000;

/// Everything the gateway knows about one request when it enters the
/// pipeline.
#[derive(Debug, Clone)]
pub struct PipelineCommand {
    pub request_id: String,
    pub app_id: String,
    pub org_id: Option<String>,
    pub user_email: Option<String>,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub environment: String,
    pub feature: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub stream: bool,
    pub dry_run: bool,
    /// Passthrough provider key; `enc:`-prefixed values are decrypted via
    /// the encryption port.
    pub api_key: Option<String>,
    /// App-level model restriction from the resolved credentials.
    pub allowed_models: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Allowed,
    DeniedFeature,
    DeniedPolicy,
    DeniedBudget,
    DeniedAbuse,
    DryRun,
    Error,
}

impl RequestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestOutcome::Allowed => "allowed",
            RequestOutcome::DeniedFeature => "denied_feature",
            RequestOutcome::DeniedPolicy => "denied_policy",
            RequestOutcome::DeniedBudget => "denied_budget",
            RequestOutcome::DeniedAbuse => "denied_abuse",
            RequestOutcome::DryRun => "dry_run",
            RequestOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DryRunReport {
    pub would_be_allowed: bool,
    pub estimated_cost_usd: Decimal,
    pub policy_action: PolicyAction,
    pub budget_remaining_usd: Option<Decimal>,
    pub budget_usage_percent: f64,
}

pub struct PipelineResult {
    pub request_id: String,
    pub outcome: RequestOutcome,
    pub response: Option<ChatResponse>,
    pub decision: Decision,
    pub policy: Option<PolicyDecision>,
    pub budget: Option<BudgetStatus>,
    pub security: Option<SecurityResult>,
    pub feature: Option<FeatureCheckResult>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub dry_run: Option<DryRunReport>,
    pub trace_id: Option<Uuid>,
    pub cooldown_seconds: Option<u64>,
}

impl PipelineResult {
    pub fn allowed(&self) -> bool {
        matches!(self.outcome, RequestOutcome::Allowed | RequestOutcome::DryRun)
    }
}

/// Outcome of `execute_stream`: either the admission layer refused (or
/// errored, or dry-ran), or a live metered stream of canonical chunks.
pub enum StreamOutcome {
    Denied(Box<PipelineResult>),
    Stream {
        stream: MeteredStream,
        request_id: String,
        model: String,
        security: SecurityResult,
    },
}

pub struct Pipeline {
    policies: Arc<dyn PolicyRepository>,
    budgets: Arc<dyn BudgetRepository>,
    features: Arc<dyn FeatureRegistryRepository>,
    audit: Arc<dyn AuditLogRepository>,
    usage: Arc<dyn UsageRepository>,
    tracer: Arc<dyn RequestTracing>,
    providers: Arc<ProviderRegistry>,
    metrics: Arc<dyn MetricsSink>,
    abuse: Option<Arc<dyn AbuseDetector>>,
    encryption: Option<Arc<dyn Encryption>>,
    embedding_providers: Vec<Arc<dyn crate::providers::embeddings::EmbeddingProvider>>,
    failsafe: Arc<FailsafeSet>,
    provider_timeout: Duration,
    local_provider_timeout: Duration,
}

/// State carried out of the admission phase into the provider call.
struct Admission {
    trace_id: Option<Uuid>,
    builder: DecisionBuilder,
    policy: PolicyDecision,
    budget: BudgetStatus,
    security: SecurityResult,
    budgets: Vec<Budget>,
    feature: Option<FeatureCheckResult>,
    provider: Arc<dyn LlmProvider>,
    api_key: Option<String>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policies: Arc<dyn PolicyRepository>,
        budgets: Arc<dyn BudgetRepository>,
        features: Arc<dyn FeatureRegistryRepository>,
        audit: Arc<dyn AuditLogRepository>,
        usage: Arc<dyn UsageRepository>,
        tracer: Arc<dyn RequestTracing>,
        providers: Arc<ProviderRegistry>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Pipeline {
            policies,
            budgets,
            features,
            audit,
            usage,
            tracer,
            providers,
            metrics,
            abuse: None,
            encryption: None,
            embedding_providers: vec![],
            failsafe: Arc::new(FailsafeSet::with_defaults()),
            provider_timeout: DEFAULT_PROVIDER_TIMEOUT,
            local_provider_timeout: DEFAULT_LOCAL_PROVIDER_TIMEOUT,
        }
    }

    pub fn with_abuse_detector(mut self, detector: Arc<dyn AbuseDetector>) -> Self {
        self.abuse = Some(detector);
        self
    }

    pub fn with_encryption(mut self, encryption: Arc<dyn Encryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_timeouts(mut self, provider: Duration, local: Duration) -> Self {
        self.provider_timeout = provider;
        self.local_provider_timeout = local;
        self
    }

    pub fn failsafe(&self) -> &FailsafeSet {
        &self.failsafe
    }

    // ── Synchronous execution ────────────────────────────────

    pub async fn execute(&self, command: PipelineCommand) -> PipelineResult {
        let admission = match self.admit(&command).await {
            Ok(admission) => admission,
            Err(denied) => return *denied,
        };

        let Admission {
            trace_id,
            mut builder,
            policy,
            budget,
            security,
            budgets,
            feature,
            provider,
            api_key,
        } = admission;

        let request = ChatRequest {
            model: command.model.clone(),
            messages: command.messages.clone(),
            max_tokens: command.max_tokens,
            temperature: command.temperature,
            stream: false,
        };

        let timeout = self.timeout_for(provider.name());
        self.start_span(trace_id, "llm_call", None).await;
        self.metrics.request_started(&command.app_id);
        builder.begin_stage();
        let started = Instant::now();

        let call = tokio::time::timeout(timeout, provider.chat(&request, api_key.as_deref())).await;
        let latency = started.elapsed();

        let response = match call {
            Err(_) => {
                self.metrics.request_finished(&command.app_id);
                self.metrics.record_timeout(&command.app_id, &command.model);
                self.failsafe.record_failure("provider");
                self.end_span(trace_id, "llm_call", "timeout", None, Some("deadline exceeded"))
                    .await;
                builder.error(DecisionStage::LlmCall, codes::PROVIDER_TIMEOUT, "provider call timed out");
                self.fail_trace(trace_id, "provider call timed out", "llm_call", TraceStatus::Timeout, Decimal::ZERO)
                    .await;
                return self.error_result(
                    &command,
                    builder,
                    codes::PROVIDER_TIMEOUT,
                    "provider call timed out",
                    Some(policy),
                    Some(budget),
                    Some(security),
                    trace_id,
                );
            }
            Ok(Err(e)) => {
                self.metrics.request_finished(&command.app_id);
                self.metrics.record_error(&command.app_id, "provider");
                self.failsafe.record_failure("provider");
                self.end_span(trace_id, "llm_call", "error", None, Some(&e.to_string()))
                    .await;
                builder.error(DecisionStage::LlmCall, codes::PROVIDER_ERROR, &e.to_string());
                self.fail_trace(trace_id, &e.to_string(), "llm_call", TraceStatus::Error, Decimal::ZERO)
                    .await;
                return self.error_result(
                    &command,
                    builder,
                    codes::PROVIDER_ERROR,
                    &e.to_string(),
                    Some(policy),
                    Some(budget),
                    Some(security),
                    trace_id,
                );
            }
            Ok(Ok(response)) => response,
        };

        self.failsafe.record_success("provider");
        self.end_span(
            trace_id,
            "llm_call",
            "ok",
            Some(json!({
                "input_tokens": response.input_tokens,
                "output_tokens": response.output_tokens,
            })),
            None,
        )
        .await;
        builder.allow_with(
            DecisionStage::LlmCall,
            "LLM_CALL_OK",
            "provider call succeeded",
            json!({"provider": provider.name()}),
        );

        // Ledger: the post-call actual cost is what is committed, never the
        // estimate. The usage row is the idempotency gate — a replayed
        // request_id inserts nothing and must not touch budgets.
        let actual_cost = BudgetChecker::estimate_cost(
            &command.model,
            response.input_tokens,
            response.output_tokens,
        );
        let usage_record = UsageRecord {
            request_id: command.request_id.clone(),
            app_id: command.app_id.clone(),
            feature: command.feature.clone(),
            environment: command.environment.clone(),
            provider: provider.name().to_string(),
            model: command.model.clone(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            cost_usd: actual_cost,
            latency_ms: latency.as_millis() as u64,
            created_at: chrono::Utc::now(),
        };
        let inserted = match self.usage.record(&usage_record).await {
            Ok(inserted) => inserted,
            Err(e) => {
                tracing::error!("usage record failed: {}", e);
                false
            }
        };
        if inserted && actual_cost > Decimal::ZERO {
            for budget_row in &budgets {
                if let Err(e) = self.budgets.record_usage(budget_row.id, actual_cost).await {
                    tracing::error!(budget = %budget_row.id, "budget update failed: {}", e);
                }
            }
        }

        self.metrics.record_request(
            &command.app_id,
            &command.model,
            "success",
            latency.as_secs_f64(),
            response.input_tokens,
            response.output_tokens,
            actual_cost,
        );
        self.metrics.record_decision(&command.app_id, "allow", "policy");
        self.metrics.request_finished(&command.app_id);

        self.log_audit(&command, RequestOutcome::Allowed, Some(&policy), Some(&budget), Some(&response))
            .await;

        let trace_decision = if policy.action == PolicyAction::Warn || !security.safe {
            TraceDecision::Warn
        } else {
            TraceDecision::Allow
        };
        self.complete_trace(
            trace_id,
            trace_decision,
            json!({
                "input_tokens": response.input_tokens,
                "output_tokens": response.output_tokens,
                "model": response.model,
                "risk_categories": security.categories(),
            }),
        )
        .await;

        let decision = builder.build();
        PipelineResult {
            request_id: command.request_id,
            outcome: RequestOutcome::Allowed,
            response: Some(response),
            decision,
            policy: Some(policy),
            budget: Some(budget),
            security: Some(security),
            feature,
            error_code: None,
            error_message: None,
            dry_run: None,
            trace_id,
            cooldown_seconds: None,
        }
    }

    // ── Streaming execution ──────────────────────────────────

    pub async fn execute_stream(&self, command: PipelineCommand) -> StreamOutcome {
        let admission = match self.admit(&command).await {
            Ok(admission) => admission,
            Err(denied) => return StreamOutcome::Denied(denied),
        };

        let Admission {
            trace_id,
            mut builder,
            policy,
            budget,
            security,
            provider,
            api_key,
            ..
        } = admission;

        let request = ChatRequest {
            model: command.model.clone(),
            messages: command.messages.clone(),
            max_tokens: command.max_tokens,
            temperature: command.temperature,
            stream: true,
        };

        let timeout = self.timeout_for(provider.name());
        self.start_span(trace_id, "llm_call", None).await;
        self.metrics.request_started(&command.app_id);
        self.metrics.record_decision(&command.app_id, "allow", "policy");

        let opened =
            tokio::time::timeout(timeout, provider.chat_stream(&request, api_key.as_deref())).await;

        let inner = match opened {
            Err(_) => {
                self.metrics.request_finished(&command.app_id);
                self.metrics.record_timeout(&command.app_id, &command.model);
                self.end_span(trace_id, "llm_call", "timeout", None, Some("deadline exceeded"))
                    .await;
                builder.error(DecisionStage::LlmCall, codes::PROVIDER_TIMEOUT, "provider call timed out");
                self.fail_trace(trace_id, "provider call timed out", "llm_call", TraceStatus::Timeout, Decimal::ZERO)
                    .await;
                return StreamOutcome::Denied(Box::new(self.error_result(
                    &command,
                    builder,
                    codes::PROVIDER_TIMEOUT,
                    "provider call timed out",
                    Some(policy),
                    Some(budget),
                    Some(security),
                    trace_id,
                )));
            }
            Ok(Err(e)) => {
                self.metrics.request_finished(&command.app_id);
                self.metrics.record_error(&command.app_id, "provider");
                self.failsafe.record_failure("provider");
                self.end_span(trace_id, "llm_call", "error", None, Some(&e.to_string()))
                    .await;
                builder.error(DecisionStage::LlmCall, codes::PROVIDER_ERROR, &e.to_string());
                self.fail_trace(trace_id, &e.to_string(), "llm_call", TraceStatus::Error, Decimal::ZERO)
                    .await;
                return StreamOutcome::Denied(Box::new(self.error_result(
                    &command,
                    builder,
                    codes::PROVIDER_ERROR,
                    &e.to_string(),
                    Some(policy),
                    Some(budget),
                    Some(security),
                    trace_id,
                )));
            }
            Ok(Ok(stream)) => stream,
        };

        let guard = StreamGuard {
            app_id: command.app_id.clone(),
            model: command.model.clone(),
            metrics: self.metrics.clone(),
            tracer: self.tracer.clone(),
            trace_id,
            risk_categories: security.categories(),
            started: Instant::now(),
            finished: false,
        };

        StreamOutcome::Stream {
            stream: MeteredStream { inner, guard },
            request_id: command.request_id,
            model: command.model,
            security,
        }
    }

    // ── Admission: steps 1–8 ─────────────────────────────────

    async fn admit(&self, command: &PipelineCommand) -> Result<Admission, Box<PipelineResult>> {
        let mut builder = DecisionBuilder::new(&command.request_id);

        // Fail-closed: a tripped database breaker refuses the request
        // before any storage call.
        if self.failsafe.is_blocked("database") {
            builder.error(
                DecisionStage::InputValidation,
                codes::SERVICE_UNAVAILABLE,
                "database circuit breaker is open",
            );
            return Err(Box::new(self.error_result(
                command,
                builder,
                codes::SERVICE_UNAVAILABLE,
                "database circuit breaker is open",
                None,
                None,
                None,
                None,
            )));
        }

        // 1. Trace (fail-open: tracing loss never blocks the request)
        let mut trace = RequestTrace::new(
            &command.request_id,
            &command.app_id,
            &command.model,
            &command.environment,
        );
        trace.org_id = command.org_id.clone();
        trace.user_email = command.user_email.clone();
        trace.feature = command.feature.clone();
        let trace_id = match self.tracer.create_trace(&trace).await {
            Ok(id) => {
                self.failsafe.record_success("database");
                Some(id)
            }
            Err(e) => {
                tracing::warn!("trace creation failed: {}", e);
                self.record_store_failure(&e);
                None
            }
        };

        let estimated_input = estimate_input_tokens(&command.messages);
        let estimated_output = command.max_tokens.unwrap_or(DEFAULT_MAX_OUTPUT_TOKENS);
        let estimated_cost =
            BudgetChecker::estimate_cost(&command.model, estimated_input, estimated_output);

        // 2. Abuse check (optional, pass-through when unconfigured)
        if let Some(detector) = &self.abuse {
            self.start_span(trace_id, "abuse_check", None).await;
            builder.begin_stage();
            let result = detector
                .check_request(
                    &command.app_id,
                    command.feature.as_deref().unwrap_or("default"),
                    &command.model,
                    &command.request_id,
                )
                .await;
            self.end_span(
                trace_id,
                "abuse_check",
                if result.blocked { "blocked" } else { "ok" },
                None,
                None,
            )
            .await;
            if result.blocked {
                let reason = result
                    .reason
                    .clone()
                    .unwrap_or_else(|| "blocked for abuse".to_string());
                builder.block(DecisionStage::AbuseCheck, codes::DENIED_ABUSE, &reason);
                self.metrics.record_decision(&command.app_id, "deny", "abuse");
                self.fail_trace(trace_id, &reason, "abuse_check", TraceStatus::Blocked, estimated_cost)
                    .await;
                self.log_audit(command, RequestOutcome::DeniedAbuse, None, None, None).await;
                let mut denied = self.denied_result(
                    command,
                    builder,
                    RequestOutcome::DeniedAbuse,
                    codes::DENIED_ABUSE,
                    &reason,
                    trace_id,
                );
                denied.cooldown_seconds = result.cooldown_seconds;
                return Err(Box::new(denied));
            }
            builder.allow(DecisionStage::AbuseCheck, "ABUSE_OK", "no abuse pattern detected");
        }

        // 3. Feature check
        self.start_span(trace_id, "feature_check", None).await;
        builder.begin_stage();
        let registry = match self.features.registry_for_app(&command.app_id).await {
            Ok(registry) => {
                self.failsafe.record_success("database");
                registry
            }
            Err(e) => {
                self.record_store_failure(&e);
                self.end_span(trace_id, "feature_check", "error", None, Some(&e.to_string()))
                    .await;
                builder.error(DecisionStage::FeatureCheck, codes::SERVICE_UNAVAILABLE, &e.to_string());
                self.fail_trace(trace_id, &e.to_string(), "feature_check", TraceStatus::Error, estimated_cost)
                    .await;
                return Err(Box::new(self.error_result(
                    command,
                    builder,
                    codes::SERVICE_UNAVAILABLE,
                    "feature registry unavailable",
                    None,
                    None,
                    None,
                    trace_id,
                )));
            }
        };
        let feature_result = check_feature(
            registry.as_ref(),
            command.feature.as_deref(),
            FeatureAction::Chat,
            &command.model,
            &command.environment,
            Some(estimated_input + estimated_output),
            Some(estimated_cost),
        );
        self.end_span(
            trace_id,
            "feature_check",
            if feature_result.allowed { "ok" } else { "denied" },
            None,
            None,
        )
        .await;
        if !feature_result.allowed {
            builder.deny(
                DecisionStage::FeatureCheck,
                feature_result.decision.code(),
                &feature_result.reason,
            );
            self.metrics.record_decision(&command.app_id, "deny", "feature");
            self.fail_trace(trace_id, &feature_result.reason, "feature_check", TraceStatus::Blocked, estimated_cost)
                .await;
            self.log_audit(command, RequestOutcome::DeniedFeature, None, None, None).await;
            let mut denied = self.denied_result(
                command,
                builder,
                RequestOutcome::DeniedFeature,
                feature_result.decision.code(),
                &feature_result.reason,
                trace_id,
            );
            denied.feature = Some(feature_result);
            return Err(Box::new(denied));
        }
        builder.allow(
            DecisionStage::FeatureCheck,
            feature_result.decision.code(),
            &feature_result.reason,
        );

        // 4. Policy evaluation
        self.start_span(trace_id, "policy_check", None).await;
        builder.begin_stage();
        let rules = match self
            .policies
            .get_active_rules(command.org_id.as_deref(), Some(&command.app_id), Some(&command.environment))
            .await
        {
            Ok(rules) => {
                self.failsafe.record_success("database");
                rules
            }
            Err(e) => {
                self.record_store_failure(&e);
                self.end_span(trace_id, "policy_check", "error", None, Some(&e.to_string()))
                    .await;
                builder.error(DecisionStage::PolicyCheck, codes::SERVICE_UNAVAILABLE, &e.to_string());
                self.fail_trace(trace_id, &e.to_string(), "policy_check", TraceStatus::Error, estimated_cost)
                    .await;
                return Err(Box::new(self.error_result(
                    command,
                    builder,
                    codes::SERVICE_UNAVAILABLE,
                    "policy store unavailable",
                    None,
                    None,
                    None,
                    trace_id,
                )));
            }
        };
        let policy_ctx = ConditionContext {
            model: command.model.clone(),
            environment: command.environment.clone(),
            feature: command.feature.clone(),
            app_id: command.app_id.clone(),
            input_tokens: Some(estimated_input),
            output_tokens: None,
            max_tokens: command.max_tokens,
            current_hour: None,
        };
        let policy = PolicyEvaluator::evaluate(&rules, &policy_ctx, &command.allowed_models);
        self.end_span(
            trace_id,
            "policy_check",
            if policy.is_denied() { "denied" } else { "ok" },
            None,
            None,
        )
        .await;
        if policy.is_denied() {
            let code = policy.code.clone().unwrap_or_else(|| codes::POLICY_RULE_DENIED.to_string());
            let reason = policy.reasons.join("; ");
            builder.deny(DecisionStage::PolicyCheck, &code, &reason);
            if let Some(rule) = policy.matched_rules.last() {
                builder.with_rule(&rule.id);
            }
            self.metrics.record_decision(&command.app_id, "deny", "policy");
            self.fail_trace(trace_id, &reason, "policy_check", TraceStatus::Blocked, estimated_cost)
                .await;
            self.log_audit(command, RequestOutcome::DeniedPolicy, Some(&policy), None, None)
                .await;
            let mut denied = self.denied_result(
                command,
                builder,
                RequestOutcome::DeniedPolicy,
                &code,
                &reason,
                trace_id,
            );
            denied.policy = Some(policy);
            return Err(Box::new(denied));
        }
        for warning in &policy.warnings {
            builder.warn(DecisionStage::PolicyCheck, codes::POLICY_RULE_WARNING, warning);
        }
        if policy.warnings.is_empty() {
            builder.allow(DecisionStage::PolicyCheck, "POLICY_OK", "no blocking rules");
        }

        // 5. Security analysis: detect-only, never denies
        self.start_span(trace_id, "security_check", None).await;
        builder.begin_stage();
        let security = SecurityGuard::full_analysis(&command.messages);
        self.end_span(
            trace_id,
            "security_check",
            if security.safe { "ok" } else { "findings" },
            Some(json!({
                "risk_level": security.risk_level.as_str(),
                "risk_score": security.risk_score,
            })),
            None,
        )
        .await;
        if security.safe {
            builder.allow(DecisionStage::SecurityCheck, "SECURITY_OK", "no findings");
        } else {
            for finding in &security.findings {
                let code = match finding.category.as_str() {
                    "prompt_injection" => codes::SECURITY_PROMPT_INJECTION,
                    "secrets" => codes::SECURITY_SENSITIVE_DATA,
                    "pii" => codes::SECURITY_SENSITIVE_DATA,
                    _ => codes::SECURITY_INVALID_STRUCTURE,
                };
                builder.warn(DecisionStage::SecurityCheck, code, &finding.description);
            }
        }

        // 6. Budget check
        self.start_span(trace_id, "budget_check", None).await;
        builder.begin_stage();
        let budgets = match self
            .budgets
            .get_budgets_for_app(
                &command.app_id,
                command.org_id.as_deref(),
                command.user_email.as_deref(),
                command.feature.as_deref(),
                &command.environment,
            )
            .await
        {
            Ok(budgets) => {
                self.failsafe.record_success("database");
                budgets
            }
            Err(e) => {
                self.record_store_failure(&e);
                self.end_span(trace_id, "budget_check", "error", None, Some(&e.to_string()))
                    .await;
                builder.error(DecisionStage::BudgetCheck, codes::SERVICE_UNAVAILABLE, &e.to_string());
                self.fail_trace(trace_id, &e.to_string(), "budget_check", TraceStatus::Error, estimated_cost)
                    .await;
                return Err(Box::new(self.error_result(
                    command,
                    builder,
                    codes::SERVICE_UNAVAILABLE,
                    "budget store unavailable",
                    Some(policy),
                    None,
                    Some(security),
                    trace_id,
                )));
            }
        };
        let budget = BudgetChecker::check(&budgets, estimated_cost);
        self.end_span(
            trace_id,
            "budget_check",
            if budget.allowed { "ok" } else { "denied" },
            None,
            None,
        )
        .await;
        if !budget.allowed {
            let reason = if budget.reasons.is_empty() {
                "budget exceeded".to_string()
            } else {
                budget.reasons.join("; ")
            };
            builder.deny(DecisionStage::BudgetCheck, codes::BUDGET_HARD_LIMIT_EXCEEDED, &reason);
            self.metrics.record_decision(&command.app_id, "deny", "budget");
            self.fail_trace(trace_id, &reason, "budget_check", TraceStatus::Blocked, estimated_cost)
                .await;
            self.log_audit(command, RequestOutcome::DeniedBudget, Some(&policy), Some(&budget), None)
                .await;
            let mut denied = self.denied_result(
                command,
                builder,
                RequestOutcome::DeniedBudget,
                codes::BUDGET_HARD_LIMIT_EXCEEDED,
                &reason,
                trace_id,
            );
            denied.policy = Some(policy);
            denied.budget = Some(budget);
            return Err(Box::new(denied));
        }
        if budget.has_warning() {
            builder.warn(
                DecisionStage::BudgetCheck,
                codes::BUDGET_SOFT_LIMIT_WARNING,
                &format!("budget usage at {:.1}%", budget.usage_percent),
            );
        } else {
            builder.allow(DecisionStage::BudgetCheck, "BUDGET_OK", "within budget");
        }

        // 7. Dry-run exit: no provider call, no ledger mutation
        if command.dry_run {
            self.complete_trace(
                trace_id,
                TraceDecision::Allow,
                json!({
                    "decision_reasons": ["dry_run"],
                    "estimated_cost_usd": estimated_cost.to_f64(),
                    "risk_categories": security.categories(),
                }),
            )
            .await;
            let report = DryRunReport {
                would_be_allowed: true,
                estimated_cost_usd: estimated_cost,
                policy_action: policy.action,
                budget_remaining_usd: budget.remaining_usd,
                budget_usage_percent: budget.usage_percent,
            };
            let decision = builder.build();
            return Err(Box::new(PipelineResult {
                request_id: command.request_id.clone(),
                outcome: RequestOutcome::DryRun,
                response: None,
                decision,
                policy: Some(policy),
                budget: Some(budget),
                security: Some(security),
                feature: Some(feature_result),
                error_code: None,
                error_message: None,
                dry_run: Some(report),
                trace_id,
                cooldown_seconds: None,
            }));
        }

        // 8. Provider selection and API key resolution
        let Some(provider) = self.providers.select(&command.model) else {
            let message = format!("no provider supports model '{}'", command.model);
            builder.error(DecisionStage::LlmCall, codes::PROVIDER_ERROR, &message);
            self.fail_trace(trace_id, &message, "llm_call", TraceStatus::Error, estimated_cost)
                .await;
            return Err(Box::new(self.error_result(
                command,
                builder,
                codes::PROVIDER_ERROR,
                &message,
                Some(policy),
                Some(budget),
                Some(security),
                trace_id,
            )));
        };
        if self.failsafe.is_blocked("provider") {
            builder.error(DecisionStage::LlmCall, codes::SERVICE_UNAVAILABLE, "provider circuit breaker is open");
            self.fail_trace(trace_id, "provider circuit breaker is open", "llm_call", TraceStatus::Error, estimated_cost)
                .await;
            return Err(Box::new(self.error_result(
                command,
                builder,
                codes::SERVICE_UNAVAILABLE,
                "provider circuit breaker is open",
                Some(policy),
                Some(budget),
                Some(security),
                trace_id,
            )));
        }

        let is_local = is_local_provider(provider.name());
        if command.api_key.is_none() && !is_local {
            let message = format!("API key required for provider '{}'", provider.name());
            builder.error(DecisionStage::InputValidation, codes::API_KEY_REQUIRED, &message);
            self.fail_trace(trace_id, &message, "validation", TraceStatus::Error, estimated_cost)
                .await;
            return Err(Box::new(self.error_result(
                command,
                builder,
                codes::API_KEY_REQUIRED,
                &message,
                Some(policy),
                Some(budget),
                Some(security),
                trace_id,
            )));
        }

        let api_key = match &command.api_key {
            Some(key) if key.starts_with("enc:") => match &self.encryption {
                Some(encryption) => {
                    self.start_span(trace_id, "decrypt_api_key", None).await;
                    match encryption.decrypt_api_key(&key[4..]).await {
                        Ok(plaintext) => {
                            self.end_span(trace_id, "decrypt_api_key", "ok", None, None).await;
                            Some(plaintext)
                        }
                        Err(e) => {
                            self.end_span(trace_id, "decrypt_api_key", "error", None, Some(&e.to_string()))
                                .await;
                            let message = format!("failed to decrypt API key: {}", e);
                            builder.error(DecisionStage::InputValidation, codes::DECRYPTION_FAILED, &message);
                            self.fail_trace(trace_id, &message, "decrypt_api_key", TraceStatus::Error, estimated_cost)
                                .await;
                            return Err(Box::new(self.error_result(
                                command,
                                builder,
                                codes::DECRYPTION_FAILED,
                                &message,
                                Some(policy),
                                Some(budget),
                                Some(security),
                                trace_id,
                            )));
                        }
                    }
                }
                // No encryption port configured: pass through unchanged
                None => Some(key.clone()),
            },
            Some(key) => Some(key.clone()),
            None => None,
        };

        Ok(Admission {
            trace_id,
            builder,
            policy,
            budget,
            security,
            budgets,
            feature: Some(feature_result),
            provider,
            api_key,
        })
    }

    // ── Helpers ──────────────────────────────────────────────

    fn timeout_for(&self, provider_name: &str) -> Duration {
        if is_local_provider(provider_name) {
            self.local_provider_timeout
        } else {
            self.provider_timeout
        }
    }

    fn record_store_failure(&self, e: &StoreError) {
        if matches!(e, StoreError::Unavailable(_)) {
            self.failsafe.record_failure("database");
        }
    }

    async fn start_span(&self, trace_id: Option<Uuid>, step: &str, payload: Option<serde_json::Value>) {
        if let Some(id) = trace_id {
            if let Err(e) = self.tracer.start_span(id, step, payload).await {
                tracing::warn!(step, "start_span failed: {}", e);
            }
        }
    }

    async fn end_span(
        &self,
        trace_id: Option<Uuid>,
        step: &str,
        status: &str,
        payload: Option<serde_json::Value>,
        error: Option<&str>,
    ) {
        if let Some(id) = trace_id {
            if let Err(e) = self.tracer.end_span(id, step, status, payload, error).await {
                tracing::warn!(step, "end_span failed: {}", e);
            }
        }
    }

    async fn complete_trace(
        &self,
        trace_id: Option<Uuid>,
        decision: TraceDecision,
        final_data: serde_json::Value,
    ) {
        if let Some(id) = trace_id {
            if let Err(e) = self.tracer.complete_trace(id, decision, final_data).await {
                tracing::warn!("complete_trace failed: {}", e);
            }
        }
    }

    async fn fail_trace(
        &self,
        trace_id: Option<Uuid>,
        error: &str,
        step: &str,
        status: TraceStatus,
        cost_avoided: Decimal,
    ) {
        if let Some(id) = trace_id {
            if let Err(e) = self.tracer.fail_trace(id, error, step, status, cost_avoided).await {
                tracing::warn!("fail_trace failed: {}", e);
            }
        }
    }

    async fn log_audit(
        &self,
        command: &PipelineCommand,
        outcome: RequestOutcome,
        policy: Option<&PolicyDecision>,
        budget: Option<&BudgetStatus>,
        response: Option<&ChatResponse>,
    ) {
        let mut entry = AuditEntry::llm_request(&command.request_id, &command.app_id, outcome.as_str());
        entry.org_id = command.org_id.clone();
        entry.model = Some(command.model.clone());
        entry.action = policy.map(|p| p.action.as_str().to_string());
        entry.details = json!({
            "environment": command.environment,
            "feature": command.feature,
            "policy_reasons": policy.map(|p| p.reasons.clone()),
            "budget_usage_percent": budget.map(|b| b.usage_percent),
        });
        entry.input_tokens = response.map(|r| r.input_tokens);
        entry.output_tokens = response.map(|r| r.output_tokens);

        // Best-effort: audit loss never surfaces to the client
        if let Err(e) = self.audit.log(&entry).await {
            tracing::warn!("audit log failed: {}", e);
            self.failsafe.record_failure("audit_log");
        } else {
            self.failsafe.record_success("audit_log");
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn error_result(
        &self,
        command: &PipelineCommand,
        builder: DecisionBuilder,
        code: &str,
        message: &str,
        policy: Option<PolicyDecision>,
        budget: Option<BudgetStatus>,
        security: Option<SecurityResult>,
        trace_id: Option<Uuid>,
    ) -> PipelineResult {
        self.metrics.record_error(&command.app_id, code);
        PipelineResult {
            request_id: command.request_id.clone(),
            outcome: RequestOutcome::Error,
            response: None,
            decision: builder.build(),
            policy,
            budget,
            security,
            feature: None,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            dry_run: None,
            trace_id,
            cooldown_seconds: None,
        }
    }

    fn denied_result(
        &self,
        command: &PipelineCommand,
        builder: DecisionBuilder,
        outcome: RequestOutcome,
        code: &str,
        message: &str,
        trace_id: Option<Uuid>,
    ) -> PipelineResult {
        PipelineResult {
            request_id: command.request_id.clone(),
            outcome,
            response: None,
            decision: builder.build(),
            policy: None,
            budget: None,
            security: None,
            feature: None,
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
            dry_run: None,
            trace_id,
            cooldown_seconds: None,
        }
    }
}

// ── Embeddings ───────────────────────────────────────────────

/// Abbreviated pipeline for `POST /v1/embeddings`: feature check with
/// action=embedding, policy evaluation, budget check with zero output
/// tokens, provider call, ledger update.
#[derive(Debug, Clone)]
pub struct EmbeddingsCommand {
    pub request_id: String,
    pub app_id: String,
    pub org_id: Option<String>,
    pub user_email: Option<String>,
    pub model: String,
    pub input: Vec<String>,
    pub environment: String,
    pub feature: Option<String>,
    pub api_key: Option<String>,
    pub allowed_models: Vec<String>,
}

pub struct EmbeddingsResult {
    pub request_id: String,
    pub outcome: RequestOutcome,
    pub response: Option<crate::models::llm::EmbeddingResponse>,
    pub decision: Decision,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl Pipeline {
    pub fn with_embedding_providers(
        mut self,
        providers: Vec<Arc<dyn crate::providers::embeddings::EmbeddingProvider>>,
    ) -> Self {
        self.embedding_providers = providers;
        self
    }

    pub async fn execute_embeddings(&self, command: EmbeddingsCommand) -> EmbeddingsResult {
        let mut builder = DecisionBuilder::new(&command.request_id);

        let estimated_input: u32 = command
            .input
            .iter()
            .map(|text| (text.len() / 4).max(1) as u32)
            .sum();
        let estimated_cost = BudgetChecker::estimate_cost(&command.model, estimated_input, 0);

        // Feature check with action=embedding
        builder.begin_stage();
        let registry = match self.features.registry_for_app(&command.app_id).await {
            Ok(registry) => registry,
            Err(e) => {
                self.record_store_failure(&e);
                builder.error(DecisionStage::FeatureCheck, codes::SERVICE_UNAVAILABLE, &e.to_string());
                return self.embeddings_error(&command, builder, codes::SERVICE_UNAVAILABLE, "feature registry unavailable");
            }
        };
        let feature_result = check_feature(
            registry.as_ref(),
            command.feature.as_deref(),
            FeatureAction::Embedding,
            &command.model,
            &command.environment,
            Some(estimated_input),
            Some(estimated_cost),
        );
        if !feature_result.allowed {
            builder.deny(
                DecisionStage::FeatureCheck,
                feature_result.decision.code(),
                &feature_result.reason,
            );
            self.metrics.record_decision(&command.app_id, "deny", "feature");
            return EmbeddingsResult {
                request_id: command.request_id.clone(),
                outcome: RequestOutcome::DeniedFeature,
                response: None,
                decision: builder.build(),
                error_code: Some(feature_result.decision.code().to_string()),
                error_message: Some(feature_result.reason),
            };
        }
        builder.allow(DecisionStage::FeatureCheck, feature_result.decision.code(), &feature_result.reason);

        // Policy evaluation
        builder.begin_stage();
        let rules = match self
            .policies
            .get_active_rules(command.org_id.as_deref(), Some(&command.app_id), Some(&command.environment))
            .await
        {
            Ok(rules) => rules,
            Err(e) => {
                self.record_store_failure(&e);
                builder.error(DecisionStage::PolicyCheck, codes::SERVICE_UNAVAILABLE, &e.to_string());
                return self.embeddings_error(&command, builder, codes::SERVICE_UNAVAILABLE, "policy store unavailable");
            }
        };
        let policy_ctx = ConditionContext {
            model: command.model.clone(),
            environment: command.environment.clone(),
            feature: command.feature.clone(),
            app_id: command.app_id.clone(),
            input_tokens: Some(estimated_input),
            output_tokens: None,
            max_tokens: None,
            current_hour: None,
        };
        let policy = PolicyEvaluator::evaluate(&rules, &policy_ctx, &command.allowed_models);
        if policy.is_denied() {
            let code = policy.code.clone().unwrap_or_else(|| codes::POLICY_RULE_DENIED.to_string());
            let reason = policy.reasons.join("; ");
            builder.deny(DecisionStage::PolicyCheck, &code, &reason);
            self.metrics.record_decision(&command.app_id, "deny", "policy");
            return EmbeddingsResult {
                request_id: command.request_id.clone(),
                outcome: RequestOutcome::DeniedPolicy,
                response: None,
                decision: builder.build(),
                error_code: Some(code),
                error_message: Some(reason),
            };
        }

        // Budget check: embeddings have no output tokens
        builder.begin_stage();
        let budgets = match self
            .budgets
            .get_budgets_for_app(
                &command.app_id,
                command.org_id.as_deref(),
                command.user_email.as_deref(),
                command.feature.as_deref(),
                &command.environment,
            )
            .await
        {
            Ok(budgets) => budgets,
            Err(e) => {
                self.record_store_failure(&e);
                builder.error(DecisionStage::BudgetCheck, codes::SERVICE_UNAVAILABLE, &e.to_string());
                return self.embeddings_error(&command, builder, codes::SERVICE_UNAVAILABLE, "budget store unavailable");
            }
        };
        let budget = BudgetChecker::check(&budgets, estimated_cost);
        if !budget.allowed {
            let reason = budget.reasons.join("; ");
            builder.deny(DecisionStage::BudgetCheck, codes::BUDGET_HARD_LIMIT_EXCEEDED, &reason);
            self.metrics.record_decision(&command.app_id, "deny", "budget");
            return EmbeddingsResult {
                request_id: command.request_id.clone(),
                outcome: RequestOutcome::DeniedBudget,
                response: None,
                decision: builder.build(),
                error_code: Some(codes::BUDGET_HARD_LIMIT_EXCEEDED.to_string()),
                error_message: Some(reason),
            };
        }

        // Provider call
        let Some(provider) = self
            .embedding_providers
            .iter()
            .find(|p| p.supports_model(&command.model))
            .cloned()
        else {
            builder.error(
                DecisionStage::LlmCall,
                codes::PROVIDER_ERROR,
                &format!("no embedding provider supports model '{}'", command.model),
            );
            return self.embeddings_error(
                &command,
                builder,
                codes::PROVIDER_ERROR,
                &format!("no embedding provider supports model '{}'", command.model),
            );
        };
        if command.api_key.is_none() && !is_local_provider(provider.name()) {
            builder.error(DecisionStage::InputValidation, codes::API_KEY_REQUIRED, "API key required");
            return self.embeddings_error(&command, builder, codes::API_KEY_REQUIRED, "API key required for embedding call");
        }

        let request = crate::models::llm::EmbeddingRequest {
            model: command.model.clone(),
            input: command.input.clone(),
        };
        self.metrics.request_started(&command.app_id);
        let started = Instant::now();
        let call =
            tokio::time::timeout(self.provider_timeout, provider.embed(&request, command.api_key.as_deref()))
                .await;
        let latency = started.elapsed();
        self.metrics.request_finished(&command.app_id);

        let response = match call {
            Err(_) => {
                self.metrics.record_timeout(&command.app_id, &command.model);
                builder.error(DecisionStage::LlmCall, codes::PROVIDER_TIMEOUT, "embedding call timed out");
                return self.embeddings_error(&command, builder, codes::PROVIDER_TIMEOUT, "embedding call timed out");
            }
            Ok(Err(e)) => {
                self.metrics.record_error(&command.app_id, "provider");
                builder.error(DecisionStage::LlmCall, codes::PROVIDER_ERROR, &e.to_string());
                return self.embeddings_error(&command, builder, codes::PROVIDER_ERROR, &e.to_string());
            }
            Ok(Ok(response)) => response,
        };

        // Ledger: actual token count from the provider, zero output
        let actual_cost = BudgetChecker::estimate_cost(&command.model, response.total_tokens, 0);
        let usage_record = UsageRecord {
            request_id: command.request_id.clone(),
            app_id: command.app_id.clone(),
            feature: command.feature.clone(),
            environment: command.environment.clone(),
            provider: provider.name().to_string(),
            model: command.model.clone(),
            input_tokens: response.total_tokens,
            output_tokens: 0,
            cost_usd: actual_cost,
            latency_ms: latency.as_millis() as u64,
            created_at: chrono::Utc::now(),
        };
        let inserted = self.usage.record(&usage_record).await.unwrap_or(false);
        if inserted && actual_cost > Decimal::ZERO {
            for budget_row in &budgets {
                if let Err(e) = self.budgets.record_usage(budget_row.id, actual_cost).await {
                    tracing::error!(budget = %budget_row.id, "budget update failed: {}", e);
                }
            }
        }
        self.metrics.record_request(
            &command.app_id,
            &command.model,
            "success",
            latency.as_secs_f64(),
            response.total_tokens,
            0,
            actual_cost,
        );
        builder.allow(DecisionStage::LlmCall, "LLM_CALL_OK", "embedding call succeeded");

        EmbeddingsResult {
            request_id: command.request_id.clone(),
            outcome: RequestOutcome::Allowed,
            response: Some(response),
            decision: builder.build(),
            error_code: None,
            error_message: None,
        }
    }

    fn embeddings_error(
        &self,
        command: &EmbeddingsCommand,
        builder: DecisionBuilder,
        code: &str,
        message: &str,
    ) -> EmbeddingsResult {
        self.metrics.record_error(&command.app_id, code);
        EmbeddingsResult {
            request_id: command.request_id.clone(),
            outcome: RequestOutcome::Error,
            response: None,
            decision: builder.build(),
            error_code: Some(code.to_string()),
            error_message: Some(message.to_string()),
        }
    }
}

// ── Streaming wrapper ────────────────────────────────────────

/// Closes the books on a streaming request exactly once, whatever the exit
/// path: completion, mid-stream error, or consumer abandonment (Drop).
struct StreamGuard {
    app_id: String,
    model: String,
    metrics: Arc<dyn MetricsSink>,
    tracer: Arc<dyn RequestTracing>,
    trace_id: Option<Uuid>,
    risk_categories: Vec<String>,
    started: Instant,
    finished: bool,
}

impl StreamGuard {
    fn finish(&mut self, status: &'static str, error: Option<String>) {
        if self.finished {
            return;
        }
        self.finished = true;

        let latency = self.started.elapsed().as_secs_f64();
        self.metrics
            .record_request(&self.app_id, &self.model, status, latency, 0, 0, Decimal::ZERO);
        self.metrics.request_finished(&self.app_id);

        if let Some(trace_id) = self.trace_id {
            let tracer = self.tracer.clone();
            let risk_categories = self.risk_categories.clone();
            // Drop cannot await; trace finalisation rides a detached task
            tokio::spawn(async move {
                let span_status = if status == "success" { "ok" } else { status };
                let _ = tracer.end_span(trace_id, "llm_call", span_status, None, error.as_deref()).await;
                if status == "success" {
                    let _ = tracer
                        .complete_trace(
                            trace_id,
                            TraceDecision::Allow,
                            json!({"risk_categories": risk_categories, "streamed": true}),
                        )
                        .await;
                } else {
                    let _ = tracer
                        .fail_trace(
                            trace_id,
                            &error.unwrap_or_else(|| "stream aborted".to_string()),
                            "llm_call",
                            TraceStatus::Error,
                            Decimal::ZERO,
                        )
                        .await;
                }
            });
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.finish("abandoned", Some("consumer abandoned stream".to_string()));
    }
}

/// Canonical chunk stream with latency metering and exactly-once
/// finalisation. Errors mid-stream are re-raised to the consumer, never
/// swallowed.
pub struct MeteredStream {
    inner: ChunkStream,
    guard: StreamGuard,
}

impl Stream for MeteredStream {
    type Item = Result<String, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                this.guard.finish("error", Some(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.guard.finish("success", None);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
