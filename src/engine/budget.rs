//! Budget admission control. Pure: budgets are loaded by the repository,
//! the estimate is used for admission, and the post-call actual cost is what
//! the ledger commits.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::pricing;
use crate::models::budget::Budget;

/// Usage percentage at which a soft warning is attached.
const SOFT_WARNING_PERCENT: f64 = 80.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub allowed: bool,
    /// None ⇒ unlimited (no budgets defined).
    pub remaining_usd: Option<Decimal>,
    pub usage_percent: f64,
    pub exceeded_budgets: Vec<Uuid>,
    pub reasons: Vec<String>,
}

impl BudgetStatus {
    pub fn has_warning(&self) -> bool {
        self.usage_percent >= SOFT_WARNING_PERCENT
    }
}

pub struct BudgetChecker;

impl BudgetChecker {
    pub fn estimate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> Decimal {
        pricing::estimate_cost(model, input_tokens, output_tokens)
    }

    /// Check an estimated cost against every applicable budget.
    ///
    /// A budget is exceeded when `hard_limit − (current_spend + estimate)`
    /// would go negative. `remaining_usd` is the minimum across budgets and
    /// `usage_percent` the maximum.
    pub fn check(budgets: &[Budget], estimated_cost: Decimal) -> BudgetStatus {
        if budgets.is_empty() {
            return BudgetStatus {
                allowed: true,
                remaining_usd: None,
                usage_percent: 0.0,
                exceeded_budgets: vec![],
                reasons: vec!["No budgets defined".to_string()],
            };
        }

        let mut exceeded: Vec<Uuid> = vec![];
        let mut reasons: Vec<String> = vec![];
        let mut min_remaining: Option<Decimal> = None;
        let mut max_usage: f64 = 0.0;

        for budget in budgets {
            let remaining = budget.remaining_usd();
            let would_remain = budget.hard_limit_usd - (budget.current_spend_usd + estimated_cost);

            if would_remain < Decimal::ZERO {
                exceeded.push(budget.id);
                reasons.push(format!(
                    "Budget '{}' would exceed: remaining ${:.4}, estimated ${:.4}",
                    budget.id, remaining, estimated_cost
                ));
            }

            min_remaining = Some(match min_remaining {
                Some(current) => current.min(remaining),
                None => remaining,
            });
            max_usage = max_usage.max(budget.usage_percent());
        }

        if max_usage >= SOFT_WARNING_PERCENT {
            reasons.push(format!("Budget usage at {:.1}%", max_usage));
        }

        BudgetStatus {
            allowed: exceeded.is_empty(),
            remaining_usd: min_remaining,
            usage_percent: max_usage,
            exceeded_budgets: exceeded,
            reasons,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::budget::BudgetPeriod;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn budget(spend: &str, soft: &str, hard: &str) -> Budget {
        let mut b = Budget::app_budget("test-app", d(soft), d(hard), BudgetPeriod::Monthly);
        b.current_spend_usd = d(spend);
        b
    }

    #[test]
    fn test_no_budgets_is_unlimited() {
        let s = BudgetChecker::check(&[], d("99999"));
        assert!(s.allowed);
        assert_eq!(s.remaining_usd, None);
        assert_eq!(s.reasons, vec!["No budgets defined".to_string()]);
    }

    #[test]
    fn test_within_budget() {
        let budgets = vec![budget("10", "80", "100")];
        let s = BudgetChecker::check(&budgets, d("5"));
        assert!(s.allowed);
        assert_eq!(s.remaining_usd, Some(d("90")));
        assert!(s.exceeded_budgets.is_empty());
    }

    #[test]
    fn test_hard_limit_exceeded() {
        let budgets = vec![budget("0.99", "0.8", "1")];
        let s = BudgetChecker::check(&budgets, d("0.05"));
        assert!(!s.allowed);
        assert_eq!(s.exceeded_budgets.len(), 1);
        assert!(s.reasons[0].contains("would exceed"));
    }

    #[test]
    fn test_exactly_at_limit_allowed() {
        // spend + estimate == hard is not an overrun
        let budgets = vec![budget("90", "80", "100")];
        let s = BudgetChecker::check(&budgets, d("10"));
        assert!(s.allowed);
    }

    #[test]
    fn test_exceeded_iff_remaining_below_estimate() {
        // Spec invariant: allowed=false ⟺ ∃b: hard − spend < estimate
        for (spend, estimate, expect_allowed) in
            [("50", "49", true), ("50", "50", true), ("50", "51", false)]
        {
            let budgets = vec![budget(spend, "80", "100")];
            let s = BudgetChecker::check(&budgets, d(estimate));
            assert_eq!(s.allowed, expect_allowed, "spend={} est={}", spend, estimate);
        }
    }

    #[test]
    fn test_min_remaining_max_usage_across_budgets() {
        let budgets = vec![budget("10", "80", "100"), budget("90", "80", "100")];
        let s = BudgetChecker::check(&budgets, d("1"));
        assert_eq!(s.remaining_usd, Some(d("10")));
        assert!((s.usage_percent - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_soft_warning_at_80_percent() {
        let budgets = vec![budget("80", "80", "100")];
        let s = BudgetChecker::check(&budgets, d("1"));
        assert!(s.allowed);
        assert!(s.has_warning());
        assert!(s.reasons.iter().any(|r| r.contains("80.0%")));
    }

    #[test]
    fn test_no_warning_below_80_percent() {
        let budgets = vec![budget("79", "80", "100")];
        let s = BudgetChecker::check(&budgets, d("0.5"));
        assert!(!s.has_warning());
    }

    #[test]
    fn test_one_exceeded_budget_blocks_all() {
        let budgets = vec![budget("10", "80", "100"), budget("99.99", "0.8", "100")];
        let s = BudgetChecker::check(&budgets, d("0.5"));
        assert!(!s.allowed);
        assert_eq!(s.exceeded_budgets.len(), 1);
        assert_eq!(s.exceeded_budgets[0], budgets[1].id);
    }

    #[test]
    fn test_zero_estimate_on_full_budget() {
        // Even a zero-cost request is denied once spend passed the hard cap
        let budgets = vec![budget("101", "80", "100")];
        let s = BudgetChecker::check(&budgets, Decimal::ZERO);
        assert!(!s.allowed);
    }

    #[test]
    fn test_estimate_cost_delegates_to_pricing() {
        assert_eq!(
            BudgetChecker::estimate_cost("gpt-4", 1000, 1000),
            pricing::estimate_cost("gpt-4", 1000, 1000)
        );
    }
}
