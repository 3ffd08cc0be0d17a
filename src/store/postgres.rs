//! Postgres implementations of the storage ports, backed by a pooled
//! `sqlx` connection. Budget spend updates are transactional; the period
//! reset is performed lazily on read and on write.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::auth::key_prefix;
use crate::crypto::generate_gateway_key;
use crate::models::app::{ApiCredential, ResolvedCredentials};
use crate::models::audit::AuditEntry;
use crate::models::budget::{Budget, BudgetPeriod, BudgetScope};
use crate::models::feature::{AppFeatureRegistry, FeatureDefinition};
use crate::models::llm::UsageRecord;
use crate::models::policy::{PolicyAction, PolicyRule, RuleConditions};
use crate::models::trace::{RequestTrace, TraceDecision, TraceSpan, TraceStatus};
use crate::ports::{
    AuditLogRepository, BudgetRepository, CreatedCredential, CredentialRepository,
    FeatureRegistryRepository, PolicyRepository, RequestTracing, StoreError, StoreResult,
    UsageRepository,
};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// `period_start` is stale when older than the period duration.
const PERIOD_ELAPSED_SQL: &str = "period_start < NOW() - (CASE period \
     WHEN 'HOURLY' THEN INTERVAL '1 hour' \
     WHEN 'DAILY' THEN INTERVAL '1 day' \
     WHEN 'WEEKLY' THEN INTERVAL '7 days' \
     ELSE INTERVAL '30 days' END)";

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(database_url)
            .await?;
        Ok(PgStore { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn budget_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<Budget> {
        let scope: String = row.try_get("scope").map_err(StoreError::from)?;
        let period: String = row.try_get("period").map_err(StoreError::from)?;
        Ok(Budget {
            id: row.try_get("id").map_err(StoreError::from)?,
            scope: match scope.as_str() {
                "USER" => BudgetScope::User,
                "ORGANIZATION" => BudgetScope::Organization,
                _ => BudgetScope::Application,
            },
            application_id: row.try_get("application_id").map_err(StoreError::from)?,
            user_email: row.try_get("user_email").map_err(StoreError::from)?,
            org_id: row.try_get("org_id").map_err(StoreError::from)?,
            feature: row.try_get("feature").map_err(StoreError::from)?,
            environment: row.try_get("environment").map_err(StoreError::from)?,
            soft_limit_usd: row.try_get("soft_limit_usd").map_err(StoreError::from)?,
            hard_limit_usd: row.try_get("hard_limit_usd").map_err(StoreError::from)?,
            period: match period.as_str() {
                "HOURLY" => BudgetPeriod::Hourly,
                "DAILY" => BudgetPeriod::Daily,
                "WEEKLY" => BudgetPeriod::Weekly,
                _ => BudgetPeriod::Monthly,
            },
            current_spend_usd: row.try_get("current_spend_usd").map_err(StoreError::from)?,
            period_start: row.try_get("period_start").map_err(StoreError::from)?,
        })
    }

    fn rule_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<PolicyRule> {
        let action: String = row.try_get("action").map_err(StoreError::from)?;
        let conditions: Value = row.try_get("conditions").map_err(StoreError::from)?;
        Ok(PolicyRule {
            id: row.try_get("id").map_err(StoreError::from)?,
            name: row.try_get("name").map_err(StoreError::from)?,
            priority: row.try_get("priority").map_err(StoreError::from)?,
            enabled: row.try_get("enabled").map_err(StoreError::from)?,
            action: match action.as_str() {
                "deny" => PolicyAction::Deny,
                "warn" => PolicyAction::Warn,
                _ => PolicyAction::Allow,
            },
            conditions: RuleConditions::from_value(&conditions)
                .map_err(|e| StoreError::Other(format!("invalid conditions: {}", e)))?,
            application_id: row.try_get("application_id").map_err(StoreError::from)?,
        })
    }

    fn trace_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<RequestTrace> {
        let status: String = row.try_get("status").map_err(StoreError::from)?;
        let decision: Option<String> = row.try_get("decision").map_err(StoreError::from)?;
        let spans: Value = row.try_get("spans").map_err(StoreError::from)?;
        Ok(RequestTrace {
            trace_id: row.try_get("trace_id").map_err(StoreError::from)?,
            request_id: row.try_get("request_id").map_err(StoreError::from)?,
            app_id: row.try_get("app_id").map_err(StoreError::from)?,
            org_id: row.try_get("org_id").map_err(StoreError::from)?,
            user_email: row.try_get("user_email").map_err(StoreError::from)?,
            feature: row.try_get("feature").map_err(StoreError::from)?,
            environment: row.try_get("environment").map_err(StoreError::from)?,
            model: row.try_get("model").map_err(StoreError::from)?,
            timestamp_start: row.try_get("timestamp_start").map_err(StoreError::from)?,
            timestamp_end: row.try_get("timestamp_end").map_err(StoreError::from)?,
            decision: decision.as_deref().map(|d| match d {
                "warn" => TraceDecision::Warn,
                "block" => TraceDecision::Block,
                "degrade" => TraceDecision::Degrade,
                _ => TraceDecision::Allow,
            }),
            status: match status.as_str() {
                "success" => TraceStatus::Success,
                "blocked" => TraceStatus::Blocked,
                "error" => TraceStatus::Error,
                "timeout" => TraceStatus::Timeout,
                _ => TraceStatus::Pending,
            },
            decision_reasons: row.try_get("decision_reasons").map_err(StoreError::from)?,
            risk_categories: row.try_get("risk_categories").map_err(StoreError::from)?,
            estimated_cost_avoided: row
                .try_get("estimated_cost_avoided")
                .map_err(StoreError::from)?,
            spans: serde_json::from_value(spans).unwrap_or_default(),
        })
    }
}

#[async_trait]
impl CredentialRepository for PgStore {
    async fn lookup_by_key_hash(&self, key_hash: &str) -> StoreResult<Option<ResolvedCredentials>> {
        let row = sqlx::query(
            r#"SELECT k.id, k.key_prefix, k.environment, k.expires_at, k.is_active,
                      a.app_id, a.is_active AS app_is_active,
                      a.allowed_providers, a.allowed_models
               FROM api_keys k
               JOIN applications a ON a.id = k.application_id
               WHERE k.key_hash = $1"#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(ResolvedCredentials {
            app_id: row.try_get("app_id").map_err(StoreError::from)?,
            api_key_id: row.try_get("id").map_err(StoreError::from)?,
            key_prefix: row.try_get("key_prefix").map_err(StoreError::from)?,
            environment: row.try_get("environment").map_err(StoreError::from)?,
            is_active: row.try_get("is_active").map_err(StoreError::from)?,
            app_is_active: row.try_get("app_is_active").map_err(StoreError::from)?,
            expires_at: row.try_get("expires_at").map_err(StoreError::from)?,
            allowed_providers: row.try_get("allowed_providers").map_err(StoreError::from)?,
            allowed_models: row.try_get("allowed_models").map_err(StoreError::from)?,
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
        let key_hash = crate::auth::hash_api_key(&plaintext);
        let prefix = key_prefix(&plaintext).to_string();

        let row = sqlx::query(
            r#"INSERT INTO api_keys (application_id, key_hash, key_prefix, name, environment, expires_at, is_active)
               SELECT a.id, $2, $3, $4, $5, $6, true FROM applications a WHERE a.app_id = $1
               RETURNING id, application_id, created_at"#,
        )
        .bind(app_id)
        .bind(&key_hash)
        .bind(&prefix)
        .bind(name)
        .bind(environment)
        .bind(expires_at)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        Ok(CreatedCredential {
            credential: ApiCredential {
                id: row.try_get("id").map_err(StoreError::from)?,
                application_id: row.try_get("application_id").map_err(StoreError::from)?,
                key_hash,
                key_prefix: prefix,
                name: name.to_string(),
                environment: environment.to_string(),
                expires_at,
                is_active: true,
                encrypted_provider_key: None,
                created_at: row.try_get("created_at").map_err(StoreError::from)?,
                last_used_at: None,
            },
            plaintext_key: plaintext,
        })
    }

    async fn rotate(&self, credential_id: i64) -> StoreResult<CreatedCredential> {
        let row = sqlx::query(
            r#"SELECT k.name, k.environment, a.app_id
               FROM api_keys k JOIN applications a ON a.id = k.application_id
               WHERE k.id = $1"#,
        )
        .bind(credential_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound)?;

        let app_id: String = row.try_get("app_id").map_err(StoreError::from)?;
        let name: String = row.try_get("name").map_err(StoreError::from)?;
        let environment: String = row.try_get("environment").map_err(StoreError::from)?;

        self.deactivate(credential_id).await?;
        CredentialRepository::create(self, &app_id, &name, &environment, None).await
    }

    async fn deactivate(&self, credential_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE api_keys SET is_active = false WHERE id = $1")
            .bind(credential_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, credential_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM api_keys WHERE id = $1")
            .bind(credential_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_last_used(&self, credential_id: i64) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
            .bind(credential_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PolicyRepository for PgStore {
    async fn get_active_rules(
        &self,
        _org_id: Option<&str>,
        app_id: Option<&str>,
        environment: Option<&str>,
    ) -> StoreResult<Vec<PolicyRule>> {
        let rows = sqlx::query(
            r#"SELECT id, name, priority, enabled, action, conditions, application_id
               FROM policy_rules
               WHERE enabled = true
                 AND (application_id IS NULL OR application_id = $1)
                 AND ($2::text IS NULL
                      OR conditions->'environments' IS NULL
                      OR conditions->'environments' @> to_jsonb(ARRAY[$2::text]))
               ORDER BY priority DESC"#,
        )
        .bind(app_id)
        .bind(environment)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::rule_from_row).collect()
    }

    async fn create(&self, rule: &PolicyRule) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO policy_rules (id, name, priority, enabled, action, conditions, application_id)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(rule.action.as_str())
        .bind(serde_json::to_value(&rule.conditions).unwrap_or(Value::Null))
        .bind(&rule.application_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update(&self, rule: &PolicyRule) -> StoreResult<()> {
        let result = sqlx::query(
            r#"UPDATE policy_rules
               SET name = $2, priority = $3, enabled = $4, action = $5, conditions = $6
               WHERE id = $1"#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(rule.action.as_str())
        .bind(serde_json::to_value(&rule.conditions).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM policy_rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<PolicyRule>> {
        let row = sqlx::query(
            "SELECT id, name, priority, enabled, action, conditions, application_id \
             FROM policy_rules WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::rule_from_row).transpose()
    }
}

#[async_trait]
impl BudgetRepository for PgStore {
    async fn get_budgets_for_app(
        &self,
        app_id: &str,
        org_id: Option<&str>,
        user_email: Option<&str>,
        feature: Option<&str>,
        environment: &str,
    ) -> StoreResult<Vec<Budget>> {
        // Lazy period reset for every stale row before the read
        sqlx::query(&format!(
            "UPDATE budgets SET current_spend_usd = 0, period_start = NOW() WHERE {}",
            PERIOD_ELAPSED_SQL
        ))
        .execute(&self.pool)
        .await?;

        let rows = sqlx::query(
            r#"SELECT id, scope, application_id, user_email, org_id, feature, environment,
                      soft_limit_usd, hard_limit_usd, period, current_spend_usd, period_start
               FROM budgets
               WHERE (feature IS NULL OR feature = $4)
                 AND (environment IS NULL OR environment = $5)
                 AND (  (scope = 'USER' AND user_email = $3)
                     OR (scope = 'ORGANIZATION' AND org_id = $2)
                     OR (scope = 'APPLICATION' AND application_id = $1))
               ORDER BY CASE scope
                   WHEN 'USER' THEN 0
                   WHEN 'ORGANIZATION' THEN 1
                   ELSE 2 END"#,
        )
        .bind(app_id)
        .bind(org_id)
        .bind(user_email)
        .bind(feature)
        .bind(environment)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::budget_from_row).collect()
    }

    async fn record_usage(&self, budget_id: Uuid, delta: Decimal) -> StoreResult<()> {
        // Serialised per budget row: SELECT ... FOR UPDATE then UPDATE
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT {} AS elapsed FROM budgets WHERE id = $1 FOR UPDATE",
            PERIOD_ELAPSED_SQL
        ))
        .bind(budget_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::NotFound)?;

        let elapsed: bool = row.try_get("elapsed").map_err(StoreError::from)?;
        if elapsed {
            sqlx::query(
                "UPDATE budgets SET current_spend_usd = $2, period_start = NOW() WHERE id = $1",
            )
            .bind(budget_id)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        } else {
            sqlx::query(
                "UPDATE budgets SET current_spend_usd = current_spend_usd + $2 WHERE id = $1",
            )
            .bind(budget_id)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create(&self, budget: &Budget) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO budgets
               (id, scope, application_id, user_email, org_id, feature, environment,
                soft_limit_usd, hard_limit_usd, period, current_spend_usd, period_start)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(budget.id)
        .bind(budget.scope.as_str())
        .bind(&budget.application_id)
        .bind(&budget.user_email)
        .bind(&budget.org_id)
        .bind(&budget.feature)
        .bind(&budget.environment)
        .bind(budget.soft_limit_usd)
        .bind(budget.hard_limit_usd)
        .bind(budget.period.as_str())
        .bind(budget.current_spend_usd)
        .bind(budget.period_start)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> StoreResult<Option<Budget>> {
        let row = sqlx::query(
            r#"SELECT id, scope, application_id, user_email, org_id, feature, environment,
                      soft_limit_usd, hard_limit_usd, period, current_spend_usd, period_start
               FROM budgets WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::budget_from_row).transpose()
    }

    async fn delete(&self, id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM budgets WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FeatureRegistryRepository for PgStore {
    async fn registry_for_app(&self, app_id: &str) -> StoreResult<Option<AppFeatureRegistry>> {
        let meta = sqlx::query(
            "SELECT strict, default_feature_id FROM feature_registries WHERE app_id = $1",
        )
        .bind(app_id)
        .fetch_optional(&self.pool)
        .await?;

        let features = sqlx::query("SELECT definition FROM features WHERE app_id = $1")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?;

        if meta.is_none() && features.is_empty() {
            return Ok(None);
        }

        let mut registry = AppFeatureRegistry::new(app_id);
        if let Some(meta) = meta {
            registry.strict = meta.try_get("strict").map_err(StoreError::from)?;
            registry.default_feature_id =
                meta.try_get("default_feature_id").map_err(StoreError::from)?;
        }
        for row in features {
            let definition: Value = row.try_get("definition").map_err(StoreError::from)?;
            let feature: FeatureDefinition = serde_json::from_value(definition)
                .map_err(|e| StoreError::Other(format!("invalid feature definition: {}", e)))?;
            registry.features.insert(feature.id.clone(), feature);
        }
        Ok(Some(registry))
    }

    async fn register_feature(&self, app_id: &str, feature: FeatureDefinition) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO features (app_id, feature_id, definition)
               VALUES ($1, $2, $3)
               ON CONFLICT (app_id, feature_id) DO UPDATE SET definition = $3"#,
        )
        .bind(app_id)
        .bind(&feature.id)
        .bind(serde_json::to_value(&feature).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_feature(&self, app_id: &str, feature_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM features WHERE app_id = $1 AND feature_id = $2")
            .bind(app_id)
            .bind(feature_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_feature(
        &self,
        app_id: &str,
        feature_id: &str,
    ) -> StoreResult<Option<FeatureDefinition>> {
        let row =
            sqlx::query("SELECT definition FROM features WHERE app_id = $1 AND feature_id = $2")
                .bind(app_id)
                .bind(feature_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(row) = row else { return Ok(None) };
        let definition: Value = row.try_get("definition").map_err(StoreError::from)?;
        serde_json::from_value(definition)
            .map(Some)
            .map_err(|e| StoreError::Other(format!("invalid feature definition: {}", e)))
    }

    async fn list_features(&self, app_id: &str) -> StoreResult<Vec<FeatureDefinition>> {
        let rows = sqlx::query("SELECT definition FROM features WHERE app_id = $1 ORDER BY feature_id")
            .bind(app_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let definition: Value = row.try_get("definition").map_err(StoreError::from)?;
                serde_json::from_value(definition)
                    .map_err(|e| StoreError::Other(format!("invalid feature definition: {}", e)))
            })
            .collect()
    }

    async fn set_strict_mode(&self, app_id: &str, strict: bool) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO feature_registries (app_id, strict) VALUES ($1, $2)
               ON CONFLICT (app_id) DO UPDATE SET strict = $2"#,
        )
        .bind(app_id)
        .bind(strict)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_default_feature(&self, app_id: &str, feature_id: Option<&str>) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO feature_registries (app_id, default_feature_id) VALUES ($1, $2)
               ON CONFLICT (app_id) DO UPDATE SET default_feature_id = $2"#,
        )
        .bind(app_id)
        .bind(feature_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditLogRepository for PgStore {
    async fn log(&self, entry: &AuditEntry) -> StoreResult<()> {
        sqlx::query(
            r#"INSERT INTO audit_logs
               (id, event_type, request_id, app_id, org_id, model, action, outcome,
                details, input_tokens, output_tokens, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(entry.id)
        .bind(&entry.event_type)
        .bind(&entry.request_id)
        .bind(&entry.app_id)
        .bind(&entry.org_id)
        .bind(&entry.model)
        .bind(&entry.action)
        .bind(&entry.outcome)
        .bind(&entry.details)
        .bind(entry.input_tokens.map(|t| t as i32))
        .bind(entry.output_tokens.map(|t| t as i32))
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn by_request_id(&self, request_id: &str) -> StoreResult<Vec<AuditEntry>> {
        self.fetch_audit("WHERE request_id = $1", request_id, i64::MAX).await
    }

    async fn by_app(&self, app_id: &str, limit: i64) -> StoreResult<Vec<AuditEntry>> {
        self.fetch_audit("WHERE app_id = $1", app_id, limit).await
    }

    async fn list_blocked(&self, limit: i64) -> StoreResult<Vec<AuditEntry>> {
        self.fetch_audit("WHERE outcome LIKE 'denied%' AND $1 = $1", "", limit)
            .await
    }

    async fn count_errors(&self, since: DateTime<Utc>) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM audit_logs WHERE outcome = 'error' AND created_at >= $1",
        )
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn cleanup_old_logs(&self, retention_days: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            "DELETE FROM audit_logs WHERE created_at < NOW() - ($1 * INTERVAL '1 day')",
        )
        .bind(retention_days)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

impl PgStore {
    /// `column` is a fixed identifier chosen by the callers above, never
    /// caller input.
    async fn grouped_usage_stats(
        &self,
        column: &str,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>> {
        let query = format!(
            "SELECT COALESCE({}, '') AS key, SUM(cost_usd) AS cost, COUNT(*) AS requests \
             FROM usage_records WHERE app_id = $1 AND created_at >= $2 \
             GROUP BY key ORDER BY key",
            column
        );
        let rows = sqlx::query(&query)
            .bind(app_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("key").map_err(StoreError::from)?,
                    row.try_get("cost").map_err(StoreError::from)?,
                    row.try_get("requests").map_err(StoreError::from)?,
                ))
            })
            .collect()
    }

    async fn fetch_audit(
        &self,
        where_clause: &str,
        bind: &str,
        limit: i64,
    ) -> StoreResult<Vec<AuditEntry>> {
        let query = format!(
            "SELECT id, event_type, request_id, app_id, org_id, model, action, outcome, \
             details, input_tokens, output_tokens, created_at \
             FROM audit_logs {} ORDER BY created_at DESC LIMIT $2",
            where_clause
        );
        let rows = sqlx::query(&query)
            .bind(bind)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(AuditEntry {
                    id: row.try_get("id").map_err(StoreError::from)?,
                    event_type: row.try_get("event_type").map_err(StoreError::from)?,
                    request_id: row.try_get("request_id").map_err(StoreError::from)?,
                    app_id: row.try_get("app_id").map_err(StoreError::from)?,
                    org_id: row.try_get("org_id").map_err(StoreError::from)?,
                    model: row.try_get("model").map_err(StoreError::from)?,
                    action: row.try_get("action").map_err(StoreError::from)?,
                    outcome: row.try_get("outcome").map_err(StoreError::from)?,
                    details: row.try_get("details").map_err(StoreError::from)?,
                    input_tokens: row
                        .try_get::<Option<i32>, _>("input_tokens")
                        .map_err(StoreError::from)?
                        .map(|t| t as u32),
                    output_tokens: row
                        .try_get::<Option<i32>, _>("output_tokens")
                        .map_err(StoreError::from)?
                        .map(|t| t as u32),
                    created_at: row.try_get("created_at").map_err(StoreError::from)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl UsageRepository for PgStore {
    async fn record(&self, usage: &UsageRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"INSERT INTO usage_records
               (request_id, app_id, feature, environment, provider, model,
                input_tokens, output_tokens, cost_usd, latency_ms, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
               ON CONFLICT (request_id) DO NOTHING"#,
        )
        .bind(&usage.request_id)
        .bind(&usage.app_id)
        .bind(&usage.feature)
        .bind(&usage.environment)
        .bind(&usage.provider)
        .bind(&usage.model)
        .bind(usage.input_tokens as i32)
        .bind(usage.output_tokens as i32)
        .bind(usage.cost_usd)
        .bind(usage.latency_ms as i64)
        .bind(usage.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_total_cost(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
        feature: Option<&str>,
        environment: Option<&str>,
    ) -> StoreResult<Decimal> {
        let total: Option<Decimal> = sqlx::query_scalar(
            r#"SELECT SUM(cost_usd) FROM usage_records
               WHERE app_id = $1 AND created_at >= $2
                 AND ($3::text IS NULL OR feature = $3)
                 AND ($4::text IS NULL OR environment = $4)"#,
        )
        .bind(app_id)
        .bind(since)
        .bind(feature)
        .bind(environment)
        .fetch_one(&self.pool)
        .await?;
        Ok(total.unwrap_or(Decimal::ZERO))
    }

    async fn list_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<UsageRecord>> {
        let rows = sqlx::query(
            r#"SELECT request_id, app_id, feature, environment, provider, model,
                      input_tokens, output_tokens, cost_usd, latency_ms, created_at
               FROM usage_records WHERE created_at >= $1"#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(UsageRecord {
                    request_id: row.try_get("request_id").map_err(StoreError::from)?,
                    app_id: row.try_get("app_id").map_err(StoreError::from)?,
                    feature: row.try_get("feature").map_err(StoreError::from)?,
                    environment: row.try_get("environment").map_err(StoreError::from)?,
                    provider: row.try_get("provider").map_err(StoreError::from)?,
                    model: row.try_get("model").map_err(StoreError::from)?,
                    input_tokens: row.try_get::<i32, _>("input_tokens").map_err(StoreError::from)?
                        as u32,
                    output_tokens: row
                        .try_get::<i32, _>("output_tokens")
                        .map_err(StoreError::from)? as u32,
                    cost_usd: row.try_get("cost_usd").map_err(StoreError::from)?,
                    latency_ms: row.try_get::<i64, _>("latency_ms").map_err(StoreError::from)?
                        as u64,
                    created_at: row.try_get("created_at").map_err(StoreError::from)?,
                })
            })
            .collect()
    }

    async fn stats_by_model(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>> {
        self.grouped_usage_stats("model", app_id, since).await
    }

    async fn stats_by_feature(
        &self,
        app_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<(String, Decimal, i64)>> {
        self.grouped_usage_stats("feature", app_id, since).await
    }

    async fn daily_stats(&self, app_id: &str, days: i64) -> StoreResult<Vec<(String, Decimal, i64)>> {
        let rows = sqlx::query(
            r#"SELECT to_char(created_at, 'YYYY-MM-DD') AS day,
                      SUM(cost_usd) AS cost, COUNT(*) AS requests
               FROM usage_records
               WHERE app_id = $1 AND created_at >= NOW() - ($2 * INTERVAL '1 day')
               GROUP BY day ORDER BY day"#,
        )
        .bind(app_id)
        .bind(days)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok((
                    row.try_get("day").map_err(StoreError::from)?,
                    row.try_get("cost").map_err(StoreError::from)?,
                    row.try_get("requests").map_err(StoreError::from)?,
                ))
            })
            .collect()
    }
}

#[async_trait]
impl RequestTracing for PgStore {
    async fn create_trace(&self, trace: &RequestTrace) -> StoreResult<Uuid> {
        sqlx::query(
            r#"INSERT INTO llm_request_traces
               (trace_id, request_id, app_id, org_id, user_email, feature, environment, model,
                timestamp_start, status, decision_reasons, risk_categories,
                estimated_cost_avoided, spans)
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"#,
        )
        .bind(trace.trace_id)
        .bind(&trace.request_id)
        .bind(&trace.app_id)
        .bind(&trace.org_id)
        .bind(&trace.user_email)
        .bind(&trace.feature)
        .bind(&trace.environment)
        .bind(&trace.model)
        .bind(trace.timestamp_start)
        .bind(trace.status.as_str())
        .bind(&trace.decision_reasons)
        .bind(&trace.risk_categories)
        .bind(trace.estimated_cost_avoided)
        .bind(serde_json::to_value(&trace.spans).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
        Ok(trace.trace_id)
    }

    async fn start_span(&self, trace_id: Uuid, step: &str, payload: Option<Value>) -> StoreResult<()> {
        let span = TraceSpan {
            step_name: step.to_string(),
            status: "running".to_string(),
            started_at: Utc::now(),
            ended_at: None,
            payload,
            error: None,
        };
        sqlx::query(
            "UPDATE llm_request_traces SET spans = spans || $2::jsonb WHERE trace_id = $1",
        )
        .bind(trace_id)
        .bind(serde_json::to_value(vec![span]).unwrap_or(Value::Null))
        .execute(&self.pool)
        .await?;
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
        // Spans live as a JSONB array; close the last open span with this
        // name in application code to keep the SQL simple.
        let mut trace = self
            .get_trace(trace_id)
            .await?
            .ok_or(StoreError::NotFound)?;
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

        sqlx::query("UPDATE llm_request_traces SET spans = $2 WHERE trace_id = $1")
            .bind(trace_id)
            .bind(serde_json::to_value(&trace.spans).unwrap_or(Value::Null))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_trace(
        &self,
        trace_id: Uuid,
        decision: TraceDecision,
        final_data: Value,
    ) -> StoreResult<()> {
        let reasons: Vec<String> = final_data["decision_reasons"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let categories: Vec<String> = final_data["risk_categories"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();

        sqlx::query(
            r#"UPDATE llm_request_traces
               SET status = 'success', decision = $2, timestamp_end = NOW(),
                   decision_reasons = $3, risk_categories = $4
               WHERE trace_id = $1"#,
        )
        .bind(trace_id)
        .bind(decision.as_str())
        .bind(&reasons)
        .bind(&categories)
        .execute(&self.pool)
        .await?;
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
        let decision = match status {
            TraceStatus::Blocked => TraceDecision::Block,
            _ => TraceDecision::Degrade,
        };
        sqlx::query(
            r#"UPDATE llm_request_traces
               SET status = $2, decision = $3, timestamp_end = NOW(),
                   decision_reasons = array_append(decision_reasons, $4),
                   estimated_cost_avoided = $5
               WHERE trace_id = $1"#,
        )
        .bind(trace_id)
        .bind(status.as_str())
        .bind(decision.as_str())
        .bind(format!("{}: {}", step, error))
        .bind(estimated_cost_avoided)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_trace(&self, trace_id: Uuid) -> StoreResult<Option<RequestTrace>> {
        let row = sqlx::query(
            r#"SELECT trace_id, request_id, app_id, org_id, user_email, feature, environment,
                      model, timestamp_start, timestamp_end, decision, status,
                      decision_reasons, risk_categories, estimated_cost_avoided, spans
               FROM llm_request_traces WHERE trace_id = $1"#,
        )
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(Self::trace_from_row).transpose()
    }

    async fn list_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<RequestTrace>> {
        let rows = sqlx::query(
            r#"SELECT trace_id, request_id, app_id, org_id, user_email, feature, environment,
                      model, timestamp_start, timestamp_end, decision, status,
                      decision_reasons, risk_categories, estimated_cost_avoided, spans
               FROM llm_request_traces WHERE timestamp_start >= $1"#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::trace_from_row).collect()
    }
}
