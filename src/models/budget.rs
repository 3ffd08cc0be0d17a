use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetScope {
    Application,
    User,
    Organization,
}

impl BudgetScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetScope::Application => "APPLICATION",
            BudgetScope::User => "USER",
            BudgetScope::Organization => "ORGANIZATION",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BudgetPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BudgetPeriod::Hourly => "HOURLY",
            BudgetPeriod::Daily => "DAILY",
            BudgetPeriod::Weekly => "WEEKLY",
            BudgetPeriod::Monthly => "MONTHLY",
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            BudgetPeriod::Hourly => Duration::hours(1),
            BudgetPeriod::Daily => Duration::days(1),
            BudgetPeriod::Weekly => Duration::weeks(1),
            BudgetPeriod::Monthly => Duration::days(30),
        }
    }
}

/// A spend cap over a period, with a scope (app, user, or org).
///
/// Invariant: hard_limit ≥ soft_limit > 0, current_spend ≥ 0. The period is
/// checked lazily on every read-or-write via [`Budget::reset_if_elapsed`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Budget {
    pub id: Uuid,
    pub scope: BudgetScope,
    pub application_id: Option<String>,
    pub user_email: Option<String>,
    pub org_id: Option<String>,
    /// None = applies to all features.
    pub feature: Option<String>,
    /// None = applies to all environments.
    pub environment: Option<String>,
    pub soft_limit_usd: Decimal,
    pub hard_limit_usd: Decimal,
    pub period: BudgetPeriod,
    pub current_spend_usd: Decimal,
    pub period_start: DateTime<Utc>,
}

impl Budget {
    pub fn app_budget(app_id: &str, soft: Decimal, hard: Decimal, period: BudgetPeriod) -> Budget {
        Budget {
            id: Uuid::new_v4(),
            scope: BudgetScope::Application,
            application_id: Some(app_id.to_string()),
            user_email: None,
            org_id: None,
            feature: None,
            environment: None,
            soft_limit_usd: soft,
            hard_limit_usd: hard,
            period,
            current_spend_usd: Decimal::ZERO,
            period_start: Utc::now(),
        }
    }

    /// Reset the ledger if the period elapsed. Idempotent: a second call in
    /// the same period is a no-op.
    pub fn reset_if_elapsed(&mut self, now: DateTime<Utc>) -> bool {
        if now - self.period_start > self.period.duration() {
            self.current_spend_usd = Decimal::ZERO;
            self.period_start = now;
            true
        } else {
            false
        }
    }

    pub fn remaining_usd(&self) -> Decimal {
        (self.hard_limit_usd - self.current_spend_usd).max(Decimal::ZERO)
    }

    pub fn usage_percent(&self) -> f64 {
        if self.hard_limit_usd.is_zero() {
            return 0.0;
        }
        let ratio = self.current_spend_usd / self.hard_limit_usd;
        ratio.to_f64().map(|r| r * 100.0).unwrap_or(0.0)
    }

    pub fn is_exceeded(&self) -> bool {
        self.current_spend_usd >= self.hard_limit_usd
    }

    /// Whether this budget applies to a request with the given feature and
    /// environment. A budget with no filter applies everywhere.
    pub fn applies_to(&self, feature: Option<&str>, environment: &str) -> bool {
        if let Some(f) = &self.feature {
            if feature != Some(f.as_str()) {
                return false;
            }
        }
        if let Some(env) = &self.environment {
            if env != environment {
                return false;
            }
        }
        true
    }
}
