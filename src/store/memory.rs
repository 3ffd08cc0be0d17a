//! In-memory implementations of every storage port.
//!
//! Used by the test suite and by local development without Postgres. All
//! collections are guarded by `std::sync::RwLock`; locks are never held
//! across awaits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use uuid::Uuid;

use crate::auth::hash_api_key;
use crate::crypto::generate_gateway_key;
use crate::models::app::{ApiCredential, ResolvedCredentials};
use crate::models::audit::AuditEntry;
use crate::models::budget::Budget;
use crate::models::feature::{AppFeatureRegistry, FeatureDefinition};
use crate::models::llm::UsageRecord;
use crate::models::policy::PolicyRule;
use crate::models::trace::{RequestTrace, TraceDecision, TraceSpan, TraceStatus};
use crate::ports::{
    AuditLogRepository, BudgetRepository, CreatedCredential, CredentialRepository,
    FeatureRegistryRepository, PolicyRepository, RequestTracing, StoreError, StoreResult,
    UsageRepository,
};

#[derive(Clone)]
struct StoredCredential {
    credential: ApiCredential,
    app_id: String,
    app_is_active: bool,
    allowed_providers: Vec<String>,
    allowed_models: Vec<String>,
}

#[derive(Default)]
pub struct InMemoryStore {
    credentials: RwLock<HashMap<String, StoredCredential>>,
    policies: RwLock<Vec<PolicyRule>>,
    budgets: RwLock<HashMap<Uuid, Budget>>,
    registries: RwLock<HashMap<String, AppFeatureRegistry>>,
    audit: RwLock<Vec<AuditEntry>>,
    usage: RwLock<HashMap<String, UsageRecord>>,
    traces: RwLock<HashMap<Uuid, RequestTrace>>,
    next_credential_id: AtomicI64,
    credential_lookups: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        InMemoryStore {
            next_credential_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    // ── Seed helpers (tests, local dev) ──────────────────────

    pub fn seed_credential(
        &self,
        plaintext_key: &str,
        app_id: &str,
        environment: &str,
        is_active: bool,
        app_is_active: bool,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let id = self.next_credential_id.fetch_add(1, Ordering::SeqCst);
        let credential = ApiCredential {
            id,
            application_id: id,
            key_hash: hash_api_key(plaintext_key),
            key_prefix: crate::auth::key_prefix(plaintext_key).to_string(),
            name: format!("seeded-{}", id),
            environment: environment.to_string(),
            expires_at,
            is_active,
            encrypted_provider_key: None,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.credentials.write().unwrap().insert(
            credential.key_hash.clone(),
            StoredCredential {
                credential,
                app_id: app_id.to_string(),
                app_is_active,
                allowed_providers: vec!["openai".into(), "anthropic".into()],
                allowed_models: vec![],
            },
        );
    }

    pub fn seed_policy(&self, rule: PolicyRule) {
        self.policies.write().unwrap().push(rule);
    }

    pub fn seed_budget(&self, budget: Budget) {
        self.budgets.write().unwrap().insert(budget.id, budget);
    }

    pub fn seed_registry(&self, registry: AppFeatureRegistry) {
        self.registries
            .write()
            .unwrap()
            .insert(registry.app_id.clone(), registry);
    }

    pub fn credential_lookup_count(&self) -> usize {
        self.credential_lookups.load(Ordering::SeqCst)
    }

    pub fn budget_snapshot(&self, id: Uuid) -> Option<Budget> {
        self.budgets.read().unwrap().get(&id).cloned()
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.read().unwrap().values().cloned().collect()
    }

    pub fn trace_snapshot(&self, trace_id: Uuid) -> Option<RequestTrace> {
        self.traces.read().unwrap().get(&trace_id).cloned()
    }

    fn grouped_stats(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
        key: impl Fn(&UsageRecord) -> String,
    ) -> StoreResult<Vec<(String, Decimal, i64)>> {
        let mut grouped: HashMap<String, (Decimal, i64)> = HashMap::new();
        for record in self.usage.read().unwrap().values() {
            if record.app_id != app_id || record.created_at < since {
                continue;
            }
            let entry = grouped.entry(key(record)).or_insert((Decimal::ZERO, 0));
            entry.0 += record.cost_usd;
            entry.1 += 1;
        }
        let mut result: Vec<(String, Decimal, i64)> = grouped
            .into_iter()
            .map(|(k, (cost, count))| (k, cost, count))
            .collect();
        result.sort();
        Ok(result)
    }

    pub fn traces_for_request(&self, request_id: &str) -> Vec<RequestTrace> {
        self.traces
            .read()
            .unwrap()
            .values()
            .filter(|t| t.request_id == request_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CredentialRepository for InMemoryStore {
    async fn lookup_by_key_hash(&self, key_hash: &str) -> StoreResult<Option<ResolvedCredentials>> {
        self.credential_lookups.fetch_add(1, Ordering::SeqCst);
        let creds = self.credentials.read().unwrap();
        Ok(creds.get(key_hash).map(|stored| ResolvedCredentials {
            app_id: stored.app_id.clone(),
            api_key_id: stored.credential.id,
            key_prefix: stored.credential.key_prefix.clone(),
            environment: stored.credential.environment.clone(),
            is_active: stored.credential.is_active,
            app_is_active: stored.app_is_active,
            expires_at: stored.credential.expires_at,
            allowed_providers: stored.allowed_providers.clone(),
            allowed_models: stored.allowed_models.clone(),
            provider_api_key: None,
        }))
    }

    async fn create(
        &self,
        app_id: &str,
        name: &str,
        environment: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<CreatedCredential> {
        let plaintext = generate_gateway_key();
        let id = self.next_credential_id.fetch_add(1, Ordering::SeqCst);
        let credential = ApiCredential {
            id,
            application_id: id,
            key_hash: hash_api_key(&plaintext),
            key_prefix: crate::auth::key_prefix(&plaintext).to_string(),
            name: name.to_string(),
            environment: environment.to_string(),
            expires_at,
            is_active: true,
            encrypted_provider_key: None,
            created_at: Utc::now(),
            last_used_at: None,
        };
        self.credentials.write().unwrap().insert(
            credential.key_hash.clone(),
            StoredCredential {
                credential: credential.clone(),
                app_id: app_id.to_string(),
                app_is_active: true,
                allowed_providers: vec!["openai".into(), "anthropic".into()],
                allowed_models: vec![],
            },
        );
        Ok(CreatedCredential { credential, plaintext_key: plaintext })
    }

    async fn rotate(&self, credential_id: i64) -> StoreResult<CreatedCredential> {
        let (app_id, name, environment) = {
            let creds = self.credentials.read().unwrap();
            let stored = creds
                .values()
                .find(|s| s.credential.id == credential_id)
                .ok_or(StoreError::NotFound)?;
            (
                stored.app_id.clone(),
                stored.credential.name.clone(),
                stored.credential.environment.clone(),
            )
        };
        self.deactivate(credential_id).await?;
        CredentialRepository::create(self, &app_id, &name, &environment, None).await
    }

    async fn deactivate(&self, credential_id: i64) -> StoreResult<bool> {
        let mut creds = self.credentials.write().unwrap();
        for stored in creds.values_mut() {
            if stored.credential.id == credential_id {
                stored.credential.is_active = false;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete(&self, credential_id: i64) -> StoreResult<bool> {
        let mut creds = self.credentials.write().unwrap();
        let before = creds.len();
        creds.retain(|_, s| s.credential.id != credential_id);
        Ok(creds.len() != before)
    }

    async fn touch_last_used(&self, credential_id: i64) -> StoreResult<()> {
        let mut creds = self.credentials.write().unwrap();
        for stored in creds.values_mut() {
            if stored.credential.id == credential_id {
                stored.credential.last_used_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PolicyRepository for InMemoryStore {
    async fn get_active_rules(
        &self,
        _org_id: Option<&str>,
        app_id: Option<&str>,
        environment: Option<&str>,
    ) -> StoreResult<Vec<PolicyRule>> {
        let policies = self.policies.read().unwrap();
        let mut rules: Vec<PolicyRule> = policies
            .iter()
            .filter(|r| r.enabled)
            .filter(|r| match (&r.application_id, app_id) {
                (None, _) => true,
                (Some(scope), Some(app)) => scope == app,
                (Some(_), None) => false,
            })
            .filter(|r| match (environment, &r.conditions.environments) {
                (Some(env), Some(envs)) => envs.iter().any(|e| e == env),
                _ => true,
            })
            .cloned()
            .collect();
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));
        Ok(rules)
    }

    async fn create(&self, rule: &PolicyRule) -> StoreResult<()> {
        self.policies.write().unwrap().push(rule.clone());
        Ok(())
    }

    async fn update(&self, rule: &PolicyRule) -> StoreResult<()> {
        let mut policies = self.policies.write().unwrap();
        let existing = policies
            .iter_mut()
            .find(|r| r.id == rule.id)
            .ok_or(StoreError::NotFound)?;
        *existing = rule.clone();
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let mut policies = self.policies.write().unwrap();
        let before = policies.len();
        policies.retain(|r| r.id != id);
        Ok(policies.len() != before)
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<PolicyRule>> {
        Ok(self.policies.read().unwrap().iter().find(|r| r.id == id).cloned())
    }
}

#[async_trait]
impl BudgetRepository for InMemoryStore {
    async fn get_budgets_for_app(
        &self,
        app_id: &str,
        org_id: Option<&str>,
        user_email: Option<&str>,
        feature: Option<&str>,
        environment: &str,
    ) -> StoreResult<Vec<Budget>> {
        let now = Utc::now();
        let mut budgets = self.budgets.write().unwrap();

        let mut user_scoped = vec![];
        let mut org_scoped = vec![];
        let mut app_scoped = vec![];

        for budget in budgets.values_mut() {
            budget.reset_if_elapsed(now);
            if !budget.applies_to(feature, environment) {
                continue;
            }
            match (&budget.user_email, &budget.org_id, &budget.application_id) {
                (Some(email), _, _) if user_email == Some(email.as_str()) => {
                    user_scoped.push(budget.clone())
                }
                (None, Some(org), _) if org_id == Some(org.as_str()) => {
                    org_scoped.push(budget.clone())
                }
                (None, None, Some(app)) if app == app_id => app_scoped.push(budget.clone()),
                _ => {}
            }
        }

        // Most specific first: user → org → app
        let mut result = user_scoped;
        result.extend(org_scoped);
        result.extend(app_scoped);
        Ok(result)
    }

    async fn record_usage(&self, budget_id: Uuid, delta: Decimal) -> StoreResult<()> {
        let mut budgets = self.budgets.write().unwrap();
        let budget = budgets.get_mut(&budget_id).ok_or(StoreError::NotFound)?;
        budget.reset_if_elapsed(Utc::now());
        budget.current_spend_usd += delta;
        Ok(())
    }

    async fn create(&self, budget: &Budget) -> StoreResult<()> {
        self.budgets.write().unwrap().insert(budget.id, budget.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Budget>> {
        Ok(self.budgets.read().unwrap().get(&id).cloned())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        Ok(self.budgets.write().unwrap().remove(&id).is_some())
    }
}

#[async_trait]
impl FeatureRegistryRepository for InMemoryStore {
    async fn registry_for_app(&self, app_id: &str) -> StoreResult<Option<AppFeatureRegistry>> {
        Ok(self.registries.read().unwrap().get(app_id).cloned())
    }

    async fn register_feature(&self, app_id: &str, feature: FeatureDefinition) -> StoreResult<()> {
        let mut registries = self.registries.write().unwrap();
        let registry = registries
            .entry(app_id.to_string())
            .or_insert_with(|| AppFeatureRegistry::new(app_id));
        registry.features.insert(feature.id.clone(), feature);
        Ok(())
    }

    async fn remove_feature(&self, app_id: &str, feature_id: &str) -> StoreResult<bool> {
        let mut registries = self.registries.write().unwrap();
        Ok(registries
            .get_mut(app_id)
            .map(|r| r.features.remove(feature_id).is_some())
            .unwrap_or(false))
    }

    async fn get_feature(
        &self,
        app_id: &str,
        feature_id: &str,
    ) -> StoreResult<Option<FeatureDefinition>> {
        Ok(self
            .registries
            .read()
            .unwrap()
            .get(app_id)
            .and_then(|r| r.features.get(feature_id).cloned()))
    }

    async fn list_features(&self, app_id: &str) -> StoreResult<Vec<FeatureDefinition>> {
        Ok(self
            .registries
            .read()
            .unwrap()
            .get(app_id)
            .map(|r| r.features.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_strict_mode(&self, app_id: &str, strict: bool) -> StoreResult<()> {
        let mut registries = self.registries.write().unwrap();
        registries
            .entry(app_id.to_string())
            .or_insert_with(|| AppFeatureRegistry::new(app_id))
            .strict = strict;
        Ok(())
    }

    async fn set_default_feature(&self, app_id: &str, feature_id: Option<&str>) -> StoreResult<()> {
        let mut registries = self.registries.write().unwrap();
        registries
            .entry(app_id.to_string())
            .or_insert_with(|| AppFeatureRegistry::new(app_id))
            .default_feature_id = feature_id.map(String::from);
        Ok(())
    }
}

#[async_trait]
impl AuditLogRepository for InMemoryStore {
    async fn log(&self, entry: &AuditEntry) -> StoreResult<()> {
        self.audit.write().unwrap().push(entry.clone());
        Ok(())
    }

    async fn by_request_id(&self, request_id: &str) -> StoreResult<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn by_app(&self, app_id: &str, limit: i64) -> StoreResult<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .unwrap()
            .iter()
            .rev()
            .filter(|e| e.app_id == app_id)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn list_blocked(&self, limit: i64) -> StoreResult<Vec<AuditEntry>> {
        Ok(self
            .audit
            .read()
            .unwrap()
            .iter()
            .rev()
            .filter(|e| e.outcome.starts_with("denied"))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_errors(&self, since: DateTime<Utc>) -> StoreResult<i64> {
        Ok(self
            .audit
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.outcome == "error" && e.created_at >= since)
            .count() as i64)
    }

    async fn cleanup_old_logs(&self, retention_days: i64) -> StoreResult<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let mut audit = self.audit.write().unwrap();
        let before = audit.len();
        audit.retain(|e| e.created_at >= cutoff);
        Ok((before - audit.len()) as u64)
    }
}

#[async_trait]
impl UsageRepository for InMemoryStore {
    async fn record(&self, usage: &UsageRecord) -> StoreResult<bool> {
        let mut records = self.usage.write().unwrap();
        if records.contains_key(&usage.request_id) {
            return Ok(false);
        }
        records.insert(usage.request_id.clone(), usage.clone());
        Ok(true)
    }

    async fn get_total_cost(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
        feature: Option<&str>,
        environment: Option<&str>,
    ) -> StoreResult<Decimal> {
        Ok(self
            .usage
            .read()
            .unwrap()
            .values()
            .filter(|u| u.app_id == app_id && u.created_at >= since)
            .filter(|u| feature.map_or(true, |f| u.feature.as_deref() == Some(f)))
            .filter(|u| environment.map_or(true, |e| u.environment == e))
            .map(|u| u.cost_usd)
            .sum())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UsageRecord>> {
        Ok(self
            .usage
            .read()
            .unwrap()
            .values()
            .filter(|u| u.created_at >= since)
            .cloned()
            .collect())
    }

    async fn stats_by_model(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>> {
        self.grouped_stats(app_id, since, |r| r.model.clone())
    }

    async fn stats_by_feature(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>> {
        self.grouped_stats(app_id, since, |r| r.feature.clone().unwrap_or_default())
    }

    async fn daily_stats(&self, app_id: &str, days: i64) -> StoreResult<Vec<(String, Decimal, i64)>> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut by_day: HashMap<String, (Decimal, i64)> = HashMap::new();
        for record in self.usage.read().unwrap().values() {
            if record.app_id != app_id || record.created_at < cutoff {
                continue;
            }
            let day = record.created_at.format("%Y-%m-%d").to_string();
            let entry = by_day.entry(day).or_insert((Decimal::ZERO, 0));
            entry.0 += record.cost_usd;
            entry.1 += 1;
        }
        let mut result: Vec<(String, Decimal, i64)> = by_day
            .into_iter()
            .map(|(day, (cost, count))| (day, cost, count))
            .collect();
        result.sort();
        Ok(result)
    }
}

#[async_trait]
impl RequestTracing for InMemoryStore {
    async fn create_trace(&self, trace: &RequestTrace) -> StoreResult<Uuid> {
        self.traces
            .write()
            .unwrap()
            .insert(trace.trace_id, trace.clone());
        Ok(trace.trace_id)
    }

    async fn start_span(&self, trace_id: Uuid, step: &str, payload: Option<Value>) -> StoreResult<()> {
        let mut traces = self.traces.write().unwrap();
        let trace = traces.get_mut(&trace_id).ok_or(StoreError::NotFound)?;
        trace.spans.push(TraceSpan {
            step_name: step.to_string(),
            status: "running".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            payload,
            error: None,
        });
        Ok(())
    }

    async fn end_span(
        &self,
        trace_id: Uuid,
        step: &str,
        status: &str,
        payload: Option<Value>,
        error: Option<&str>,
    ) -> StoreResult<()> {
        let mut traces = self.traces.write().unwrap();
        let trace = traces.get_mut(&trace_id).ok_or(StoreError::NotFound)?;
        let span = trace
            .spans
            .iter_mut()
            .rev()
            .find(|s| s.step_name == step && s.ended_at.is_none())
            .ok_or(StoreError::NotFound)?;
        span.status = status.to_string();
        span.ended_at = Some(Utc::now());
        if payload.is_some() {
            span.payload = payload;
        }
        span.error = error.map(String::from);
        Ok(())
    }

    async fn complete_trace(
        &self,
        trace_id: Uuid,
        decision: TraceDecision,
        final_data: Value,
    ) -> StoreResult<()> {
        let mut traces = self.traces.write().unwrap();
        let trace = traces.get_mut(&trace_id).ok_or(StoreError::NotFound)?;
        trace.status = TraceStatus::Success;
        trace.decision = Some(decision);
        trace.timestamp_end = Some(Utc::now());
        if let Some(reasons) = final_data["decision_reasons"].as_array() {
            trace.decision_reasons = reasons
                .iter()
                .filter_map(|r| r.as_str().map(String::from))
                .collect();
        }
        if let Some(categories) = final_data["risk_categories"].as_array() {
            trace.risk_categories = categories
                .iter()
                .filter_map(|r| r.as_str().map(String::from))
                .collect();
        }
        Ok(())
    }

    async fn fail_trace(
        &self,
        trace_id: Uuid,
        error: &str,
        step: &str,
        status: TraceStatus,
        estimated_cost_avoided: Decimal,
    ) -> StoreResult<()> {
        let mut traces = self.traces.write().unwrap();
        let trace = traces.get_mut(&trace_id).ok_or(StoreError::NotFound)?;
        trace.status = status;
        trace.decision = Some(match status {
            TraceStatus::Blocked => TraceDecision::Block,
            _ => TraceDecision::Degrade,
        });
        trace.timestamp_end = Some(Utc::now());
        trace.decision_reasons.push(format!("{}: {}", step, error));
        trace.estimated_cost_avoided = estimated_cost_avoided;
        Ok(())
    }

    async fn get_trace(&self, trace_id: Uuid) -> StoreResult<Option<RequestTrace>> {
        Ok(self.traces.read().unwrap().get(&trace_id).cloned())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<RequestTrace>> {
        Ok(self
            .traces
            .read()
            .unwrap()
            .values()
            .filter(|t| t.timestamp_start >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::budget::BudgetPeriod;
    use crate::models::policy::{PolicyAction, RuleConditions};
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[tokio::test]
    async fn test_usage_record_idempotent() {
        let store = InMemoryStore::new();
        let record = UsageRecord {
            request_id: "req-1".into(),
            app_id: "test-app".into(),
            feature: None,
            environment: "development".into(),
            provider: "mock".into(),
            model: "mock-gpt-4".into(),
            input_tokens: 10,
            output_tokens: 5,
            cost_usd: d("0.01"),
            latency_ms: 42,
            created_at: Utc::now(),
        };
        assert!(store.record(&record).await.unwrap());
        // Replay with the same request_id is a no-op — no double billing
        assert!(!store.record(&record).await.unwrap());
        assert_eq!(store.usage_records().len(), 1);
    }

    #[tokio::test]
    async fn test_budget_priority_order_user_org_app() {
        let store = InMemoryStore::new();

        let app = Budget::app_budget("test-app", d("80"), d("100"), BudgetPeriod::Monthly);
        let mut user = Budget::app_budget("ignored", d("8"), d("10"), BudgetPeriod::Monthly);
        user.application_id = None;
        user.user_email = Some("dev@example.com".into());
        user.scope = crate::models::budget::BudgetScope::User;
        let mut org = Budget::app_budget("ignored", d("800"), d("1000"), BudgetPeriod::Monthly);
        org.application_id = None;
        org.org_id = Some("acme".into());
        org.scope = crate::models::budget::BudgetScope::Organization;

        store.seed_budget(app.clone());
        store.seed_budget(user.clone());
        store.seed_budget(org.clone());

        let budgets = store
            .get_budgets_for_app("test-app", Some("acme"), Some("dev@example.com"), None, "development")
            .await
            .unwrap();
        assert_eq!(budgets.len(), 3);
        assert_eq!(budgets[0].id, user.id);
        assert_eq!(budgets[1].id, org.id);
        assert_eq!(budgets[2].id, app.id);
    }

    #[tokio::test]
    async fn test_budget_feature_filter() {
        let store = InMemoryStore::new();
        let mut budget = Budget::app_budget("test-app", d("8"), d("10"), BudgetPeriod::Monthly);
        budget.feature = Some("chat".into());
        store.seed_budget(budget);

        let with_feature = store
            .get_budgets_for_app("test-app", None, None, Some("chat"), "development")
            .await
            .unwrap();
        assert_eq!(with_feature.len(), 1);

        let other_feature = store
            .get_budgets_for_app("test-app", None, None, Some("search"), "development")
            .await
            .unwrap();
        assert!(other_feature.is_empty());
    }

    #[tokio::test]
    async fn test_budget_lazy_reset_on_read() {
        let store = InMemoryStore::new();
        let mut budget = Budget::app_budget("test-app", d("8"), d("10"), BudgetPeriod::Hourly);
        budget.current_spend_usd = d("9");
        budget.period_start = Utc::now() - Duration::hours(3);
        let id = budget.id;
        store.seed_budget(budget);

        let budgets = store
            .get_budgets_for_app("test-app", None, None, None, "development")
            .await
            .unwrap();
        assert_eq!(budgets[0].current_spend_usd, Decimal::ZERO);
        assert_eq!(store.budget_snapshot(id).unwrap().current_spend_usd, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_budget_record_usage_accumulates() {
        let store = InMemoryStore::new();
        let budget = Budget::app_budget("test-app", d("8"), d("10"), BudgetPeriod::Monthly);
        let id = budget.id;
        store.seed_budget(budget);

        store.record_usage(id, d("1.5")).await.unwrap();
        store.record_usage(id, d("0.5")).await.unwrap();
        assert_eq!(store.budget_snapshot(id).unwrap().current_spend_usd, d("2.0"));
    }

    #[tokio::test]
    async fn test_policy_scoping_and_order() {
        let store = InMemoryStore::new();
        let global = PolicyRule::new("global", 1, PolicyAction::Allow, RuleConditions::default());
        let mut scoped = PolicyRule::new("scoped", 10, PolicyAction::Deny, RuleConditions::default());
        scoped.application_id = Some("test-app".into());
        let mut other = PolicyRule::new("other-app", 5, PolicyAction::Deny, RuleConditions::default());
        other.application_id = Some("other".into());

        store.seed_policy(global);
        store.seed_policy(scoped);
        store.seed_policy(other);

        let rules = store
            .get_active_rules(None, Some("test-app"), None)
            .await
            .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].name, "scoped");
        assert_eq!(rules[1].name, "global");
    }

    #[tokio::test]
    async fn test_credential_rotation_deactivates_old() {
        let store = InMemoryStore::new();
        let created = CredentialRepository::create(&store, "test-app", "ci-key", "production", None)
            .await
            .unwrap();
        assert!(created.plaintext_key.starts_with("gw_"));

        let rotated = store.rotate(created.credential.id).await.unwrap();
        assert_ne!(rotated.plaintext_key, created.plaintext_key);

        let old = store
            .lookup_by_key_hash(&created.credential.key_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(!old.is_active);
    }

    #[tokio::test]
    async fn test_trace_span_lifecycle() {
        let store = InMemoryStore::new();
        let trace = RequestTrace::new("req-1", "test-app", "mock-gpt-4", "development");
        let id = store.create_trace(&trace).await.unwrap();

        store.start_span(id, "policy_check", None).await.unwrap();
        store
            .end_span(id, "policy_check", "ok", None, None)
            .await
            .unwrap();

        let stored = store.trace_snapshot(id).unwrap();
        assert_eq!(stored.spans.len(), 1);
        assert_eq!(stored.spans[0].status, "ok");
        assert!(stored.spans[0].ended_at.unwrap() >= stored.spans[0].started_at);
    }

    #[tokio::test]
    async fn test_fail_trace_records_cost_avoided() {
        let store = InMemoryStore::new();
        let trace = RequestTrace::new("req-1", "test-app", "mock-gpt-4", "development");
        let id = store.create_trace(&trace).await.unwrap();

        store
            .fail_trace(id, "budget exceeded", "budget_check", TraceStatus::Blocked, d("0.05"))
            .await
            .unwrap();

        let stored = store.trace_snapshot(id).unwrap();
        assert_eq!(stored.status, TraceStatus::Blocked);
        assert_eq!(stored.decision, Some(TraceDecision::Block));
        assert_eq!(stored.estimated_cost_avoided, d("0.05"));
        assert!(stored.timestamp_end.is_some());
    }

    #[tokio::test]
    async fn test_usage_stats_grouping() {
        let store = InMemoryStore::new();
        for (model, feature, cost) in [
            ("gpt-4o", Some("chat"), "1.00"),
            ("gpt-4o", Some("chat"), "0.50"),
            ("claude-3-opus", None, "2.00"),
        ] {
            let record = UsageRecord {
                request_id: Uuid::new_v4().to_string(),
                app_id: "test-app".into(),
                feature: feature.map(String::from),
                environment: "production".into(),
                provider: "x".into(),
                model: model.into(),
                input_tokens: 1,
                output_tokens: 1,
                cost_usd: d(cost),
                latency_ms: 1,
                created_at: Utc::now(),
            };
            store.record(&record).await.unwrap();
        }

        let since = Utc::now() - Duration::hours(1);
        let by_model = store.stats_by_model("test-app", since).await.unwrap();
        assert_eq!(by_model.len(), 2);
        assert_eq!(by_model[0], ("claude-3-opus".to_string(), d("2.00"), 1));
        assert_eq!(by_model[1], ("gpt-4o".to_string(), d("1.50"), 2));

        let by_feature = store.stats_by_feature("test-app", since).await.unwrap();
        assert_eq!(by_feature[0].0, ""); // no-feature bucket
        assert_eq!(by_feature[1], ("chat".to_string(), d("1.50"), 2));
    }

    #[tokio::test]
    async fn test_audit_cleanup() {
        let store = InMemoryStore::new();
        let mut old = AuditEntry::llm_request("req-old", "test-app", "allowed");
        old.created_at = Utc::now() - Duration::days(100);
        store.log(&old).await.unwrap();
        store
            .log(&AuditEntry::llm_request("req-new", "test-app", "allowed"))
            .await
            .unwrap();

        let removed = store.cleanup_old_logs(30).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.by_app("test-app", 10).await.unwrap().len(), 1);
    }
}
