//! Policy evaluation. Pure: no I/O, rules are loaded by the repository.

use serde::{Deserialize, Serialize};

use crate::engine::conditions::{
    matches_app, matches_environment, matches_feature, matches_model, matches_time,
    ConditionContext,
};
use crate::engine::decision::codes;
use crate::models::policy::{PolicyAction, PolicyRule};

/// A rule that scoped to the request, by id and name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRule {
    pub id: String,
    pub name: String,
    pub action: PolicyAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    /// Stable code for the decision, set on deny.
    pub code: Option<String>,
    pub matched_rules: Vec<MatchedRule>,
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

impl PolicyDecision {
    fn allow(reasons: Vec<String>, matched_rules: Vec<MatchedRule>, warnings: Vec<String>) -> Self {
        let action = if warnings.is_empty() { PolicyAction::Allow } else { PolicyAction::Warn };
        PolicyDecision { action, code: None, matched_rules, reasons, warnings }
    }

    fn deny(
        code: &str,
        reason: String,
        matched_rules: Vec<MatchedRule>,
        mut reasons: Vec<String>,
    ) -> Self {
        reasons.push(reason);
        PolicyDecision {
            action: PolicyAction::Deny,
            code: Some(code.to_string()),
            matched_rules,
            reasons,
            warnings: vec![],
        }
    }

    pub fn is_denied(&self) -> bool {
        self.action == PolicyAction::Deny
    }
}

pub struct PolicyEvaluator;

impl PolicyEvaluator {
    /// Evaluate ordered rules against a request context.
    ///
    /// Rules are stable-sorted by priority descending, disabled rules are
    /// skipped, and the first deny short-circuits. Warn actions accumulate.
    /// After the rules, the caller's application-level `allowed_models`
    /// restriction is enforced.
    pub fn evaluate(
        rules: &[PolicyRule],
        ctx: &ConditionContext,
        credential_models: &[String],
    ) -> PolicyDecision {
        if rules.is_empty() {
            return Self::credential_check(
                ctx,
                credential_models,
                vec!["No policies defined".to_string()],
                vec![],
                vec![],
            );
        }

        let mut ordered: Vec<&PolicyRule> = rules.iter().filter(|r| r.enabled).collect();
        ordered.sort_by_key(|r| std::cmp::Reverse(r.priority));

        let mut matched_rules: Vec<MatchedRule> = vec![];
        let mut reasons: Vec<String> = vec![];
        let mut warnings: Vec<String> = vec![];

        for rule in ordered {
            if !Self::rule_applies(rule, ctx) {
                continue;
            }

            matched_rules.push(MatchedRule {
                id: rule.id.to_string(),
                name: rule.name.clone(),
                action: rule.action,
            });
            reasons.push(format!("Rule '{}' matched", rule.name));

            // Token limit
            if let (Some(limit), Some(requested)) = (rule.conditions.max_tokens, ctx.max_tokens) {
                if requested > limit {
                    let reason = format!(
                        "max_tokens ({}) exceeds limit ({}) - rule: {}",
                        requested, limit, rule.name
                    );
                    match rule.action {
                        PolicyAction::Deny => {
                            return PolicyDecision::deny(
                                codes::POLICY_MAX_TOKENS_EXCEEDED,
                                reason,
                                matched_rules,
                                reasons,
                            );
                        }
                        PolicyAction::Warn => warnings.push(reason),
                        PolicyAction::Allow => {}
                    }
                }
            }

            // Hour window
            if rule.conditions.allowed_hours.is_some() {
                let (ok, why) = matches_time(rule.conditions.allowed_hours, ctx.current_hour);
                if !ok {
                    let reason = format!(
                        "{} - rule: {}",
                        why.unwrap_or_else(|| "outside allowed hours".into()),
                        rule.name
                    );
                    match rule.action {
                        PolicyAction::Deny => {
                            return PolicyDecision::deny(
                                codes::POLICY_OUTSIDE_ALLOWED_HOURS,
                                reason,
                                matched_rules,
                                reasons,
                            );
                        }
                        PolicyAction::Warn => warnings.push(reason),
                        PolicyAction::Allow => {}
                    }
                }
            }

            // Model restriction. A rule with action=deny and a `models`
            // list is a block-list for those models; with action=warn/allow
            // the list is an allow-list constraint.
            if rule.conditions.models.is_some() || rule.conditions.blocked_models.is_some() {
                let violated = match rule.action {
                    PolicyAction::Deny => {
                        let (hit, _) =
                            matches_model(&ctx.model, rule.conditions.models.as_deref(), None);
                        let (blocked_ok, _) = matches_model(
                            &ctx.model,
                            None,
                            rule.conditions.blocked_models.as_deref(),
                        );
                        hit || !blocked_ok
                    }
                    _ => {
                        let (ok, _) = matches_model(
                            &ctx.model,
                            rule.conditions.models.as_deref(),
                            rule.conditions.blocked_models.as_deref(),
                        );
                        !ok
                    }
                };
                if violated {
                    let reason =
                        format!("Model '{}' blocked - rule: {}", ctx.model, rule.name);
                    match rule.action {
                        PolicyAction::Deny => {
                            return PolicyDecision::deny(
                                codes::POLICY_MODEL_BLOCKED,
                                reason,
                                matched_rules,
                                reasons,
                            );
                        }
                        PolicyAction::Warn => warnings.push(reason),
                        PolicyAction::Allow => {}
                    }
                }
            }
        }

        Self::credential_check(ctx, credential_models, reasons, matched_rules, warnings)
    }

    /// Application-level `allowed_models` (empty ⇒ unrestricted).
    fn credential_check(
        ctx: &ConditionContext,
        credential_models: &[String],
        reasons: Vec<String>,
        matched_rules: Vec<MatchedRule>,
        warnings: Vec<String>,
    ) -> PolicyDecision {
        if !credential_models.is_empty() {
            let (ok, _) = matches_model(&ctx.model, Some(credential_models), None);
            if !ok {
                return PolicyDecision::deny(
                    codes::POLICY_MODEL_BLOCKED,
                    format!("Model '{}' not allowed for app '{}'", ctx.model, ctx.app_id),
                    matched_rules,
                    reasons,
                );
            }
        }
        PolicyDecision::allow(reasons, matched_rules, warnings)
    }

    /// Whether the rule scopes to this request. Absent conditions do not
    /// restrict; a rule scoped to another application never applies.
    fn rule_applies(rule: &PolicyRule, ctx: &ConditionContext) -> bool {
        if let Some(app) = &rule.application_id {
            if *app != ctx.app_id {
                return false;
            }
        }
        if rule.conditions.environments.is_some() {
            let (ok, _) =
                matches_environment(&ctx.environment, rule.conditions.environments.as_deref(), None);
            if !ok {
                return false;
            }
        }
        if rule.conditions.apps.is_some() {
            let (ok, _) = matches_app(&ctx.app_id, rule.conditions.apps.as_deref());
            if !ok {
                return false;
            }
        }
        if rule.conditions.features.is_some() {
            let (ok, _) = matches_feature(ctx.feature.as_deref(), rule.conditions.features.as_deref());
            if !ok {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::policy::RuleConditions;
    use serde_json::json;

    fn ctx(model: &str) -> ConditionContext {
        ConditionContext {
            model: model.into(),
            environment: "production".into(),
            feature: Some("chat".into()),
            app_id: "test-app".into(),
            max_tokens: Some(1000),
            current_hour: Some(12),
            ..Default::default()
        }
    }

    fn rule(name: &str, priority: i32, action: PolicyAction, conditions: serde_json::Value) -> PolicyRule {
        PolicyRule::new(name, priority, action, RuleConditions::from_value(&conditions).unwrap())
    }

    #[test]
    fn test_empty_rules_allow() {
        let d = PolicyEvaluator::evaluate(&[], &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Allow);
        assert_eq!(d.reasons, vec!["No policies defined".to_string()]);
    }

    #[test]
    fn test_deny_model_pattern() {
        let rules = vec![rule("block-claude", 10, PolicyAction::Deny, json!({"models": ["claude-*"]}))];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("claude-3-opus"), &[]);
        assert!(d.is_denied());
        assert_eq!(d.code.as_deref(), Some(codes::POLICY_MODEL_BLOCKED));
        assert_eq!(d.matched_rules[0].name, "block-claude");
    }

    #[test]
    fn test_deny_rule_skips_other_models() {
        let rules = vec![rule("block-claude", 10, PolicyAction::Deny, json!({"models": ["claude-*"]}))];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Allow);
    }

    #[test]
    fn test_max_tokens_deny() {
        let rules = vec![rule("cap", 5, PolicyAction::Deny, json!({"max_tokens": 500}))];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert!(d.is_denied());
        assert_eq!(d.code.as_deref(), Some(codes::POLICY_MAX_TOKENS_EXCEEDED));
    }

    #[test]
    fn test_max_tokens_warn_accumulates() {
        let rules = vec![rule("soft-cap", 5, PolicyAction::Warn, json!({"max_tokens": 500}))];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Warn);
        assert_eq!(d.warnings.len(), 1);
    }

    #[test]
    fn test_priority_order_first_deny_wins() {
        let rules = vec![
            rule("low-warn", 1, PolicyAction::Warn, json!({"max_tokens": 500})),
            rule("high-deny", 10, PolicyAction::Deny, json!({"max_tokens": 800})),
        ];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert!(d.is_denied());
        // High-priority rule evaluated first: it is the only matched rule
        assert_eq!(d.matched_rules.len(), 1);
        assert_eq!(d.matched_rules[0].name, "high-deny");
    }

    #[test]
    fn test_disabled_rules_skipped() {
        let mut r = rule("off", 10, PolicyAction::Deny, json!({"max_tokens": 1}));
        r.enabled = false;
        let d = PolicyEvaluator::evaluate(&[r], &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Allow);
        assert!(d.matched_rules.is_empty());
    }

    #[test]
    fn test_environment_scoping() {
        let rules = vec![rule(
            "staging-only",
            5,
            PolicyAction::Deny,
            json!({"environments": ["staging"], "max_tokens": 1}),
        )];
        // Context is production — rule does not apply
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Allow);
        assert!(d.matched_rules.is_empty());
    }

    #[test]
    fn test_app_scoping_via_application_id() {
        let mut r = rule("other-app", 5, PolicyAction::Deny, json!({"max_tokens": 1}));
        r.application_id = Some("someone-else".into());
        let d = PolicyEvaluator::evaluate(&[r], &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Allow);
    }

    #[test]
    fn test_hour_window_deny() {
        let rules = vec![rule(
            "office-hours",
            5,
            PolicyAction::Deny,
            json!({"allowed_hours": [9, 17]}),
        )];
        let mut c = ctx("gpt-4o");
        c.current_hour = Some(22);
        let d = PolicyEvaluator::evaluate(&rules, &c, &[]);
        assert!(d.is_denied());
        assert_eq!(d.code.as_deref(), Some(codes::POLICY_OUTSIDE_ALLOWED_HOURS));
    }

    #[test]
    fn test_credential_model_restriction() {
        let creds = vec!["gpt-4o".to_string(), "gpt-4o-mini".to_string()];
        let d = PolicyEvaluator::evaluate(&[], &ctx("claude-3-opus"), &creds);
        assert!(d.is_denied());
        assert_eq!(d.code.as_deref(), Some(codes::POLICY_MODEL_BLOCKED));

        let d = PolicyEvaluator::evaluate(&[], &ctx("gpt-4o"), &creds);
        assert_eq!(d.action, PolicyAction::Allow);
    }

    #[test]
    fn test_empty_credential_models_unrestricted() {
        let d = PolicyEvaluator::evaluate(&[], &ctx("anything"), &[]);
        assert_eq!(d.action, PolicyAction::Allow);
    }

    #[test]
    fn test_deny_implies_matched_deny_rule_or_credential_violation() {
        // A deny decision always carries either a matched deny rule or a
        // credential-level violation.
        let rules = vec![
            rule("warn-rule", 10, PolicyAction::Warn, json!({"max_tokens": 500})),
            rule("deny-rule", 5, PolicyAction::Deny, json!({"models": ["gpt-*"]})),
        ];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert!(d.is_denied());
        assert!(d
            .matched_rules
            .iter()
            .any(|r| r.action == PolicyAction::Deny));
    }

    #[test]
    fn test_multiple_warns_accumulate() {
        let rules = vec![
            rule("w1", 10, PolicyAction::Warn, json!({"max_tokens": 500})),
            rule("w2", 5, PolicyAction::Warn, json!({"max_tokens": 800})),
        ];
        let d = PolicyEvaluator::evaluate(&rules, &ctx("gpt-4o"), &[]);
        assert_eq!(d.action, PolicyAction::Warn);
        assert_eq!(d.warnings.len(), 2);
        assert_eq!(d.matched_rules.len(), 2);
    }
}
