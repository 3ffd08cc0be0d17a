//! Pure predicate library for condition matching.
//!
//! Every function is side-effect free and returns `(matches, reason)` where
//! the reason is only set on a failed match. Deny-lists always win over
//! allow-lists. A single trailing `*` in a model pattern is a prefix
//! wildcard.

use chrono::Timelike;

use crate::models::policy::RuleConditions;

/// Outcome of a single predicate: whether it matched and, when it did not,
/// a human-readable reason.
pub type Match = (bool, Option<String>);

fn ok() -> Match {
    (true, None)
}

fn fail(reason: String) -> Match {
    (false, Some(reason))
}

pub fn matches_environment(
    env: &str,
    allowed: Option<&[String]>,
    denied: Option<&[String]>,
) -> Match {
    if let Some(denied) = denied {
        if denied.iter().any(|d| d == env) {
            return fail(format!("Environment '{}' is denied", env));
        }
    }
    if let Some(allowed) = allowed {
        if !allowed.iter().any(|a| a == env) {
            return fail(format!("Environment '{}' not in allowed list", env));
        }
    }
    ok()
}

/// Exact match, or prefix match when a pattern ends with a single `*`.
fn model_matches_pattern(model: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        model.starts_with(prefix)
    } else {
        model == pattern
    }
}

pub fn matches_model(model: &str, allowed: Option<&[String]>, denied: Option<&[String]>) -> Match {
    if let Some(denied) = denied {
        if denied.iter().any(|p| model_matches_pattern(model, p)) {
            return fail(format!("Model '{}' is blocked", model));
        }
    }
    if let Some(allowed) = allowed {
        if !allowed.iter().any(|p| model_matches_pattern(model, p)) {
            return fail(format!("Model '{}' not in allowed list", model));
        }
    }
    ok()
}

/// `None` feature asserts nothing and always matches.
pub fn matches_feature(feature: Option<&str>, allowed: Option<&[String]>) -> Match {
    let Some(feature) = feature else {
        return ok();
    };
    if let Some(allowed) = allowed {
        if !allowed.iter().any(|a| a == feature) {
            return fail(format!("Feature '{}' not allowed", feature));
        }
    }
    ok()
}

/// The literal `"*"` in the allowed list matches any app.
pub fn matches_app(app_id: &str, allowed: Option<&[String]>) -> Match {
    if let Some(allowed) = allowed {
        if !allowed.iter().any(|a| a == "*" || a == app_id) {
            return fail(format!("App '{}' not in allowed list", app_id));
        }
    }
    ok()
}

pub fn matches_tokens(
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
    max_input: Option<u32>,
    max_output: Option<u32>,
    max_total: Option<u32>,
) -> Match {
    if let (Some(input), Some(max)) = (input_tokens, max_input) {
        if input > max {
            return fail(format!("Input tokens {} exceed limit {}", input, max));
        }
    }
    if let (Some(output), Some(max)) = (output_tokens, max_output) {
        if output > max {
            return fail(format!("Output tokens {} exceed limit {}", output, max));
        }
    }
    if let Some(max) = max_total {
        let total = input_tokens.unwrap_or(0) + output_tokens.unwrap_or(0);
        if total > max {
            return fail(format!("Total tokens {} exceed limit {}", total, max));
        }
    }
    ok()
}

/// `allowed_hours = (a, b)` inclusive. When `a <= b` the window is within a
/// day; otherwise it wraps midnight (e.g. 22–6).
pub fn matches_time(allowed_hours: Option<(u8, u8)>, current_hour: Option<u8>) -> Match {
    let Some((start, end)) = allowed_hours else {
        return ok();
    };
    let hour = current_hour.unwrap_or_else(|| chrono::Utc::now().hour() as u8);

    let inside = if start <= end {
        hour >= start && hour <= end
    } else {
        hour >= start || hour <= end
    };

    if inside {
        ok()
    } else {
        fail(format!(
            "Current hour {} outside allowed hours {}-{}",
            hour, start, end
        ))
    }
}

/// Request-side values the conditions are matched against.
#[derive(Debug, Clone, Default)]
pub struct ConditionContext {
    pub model: String,
    pub environment: String,
    pub feature: Option<String>,
    pub app_id: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub max_tokens: Option<u32>,
    /// Overridable for tests; `None` means "now".
    pub current_hour: Option<u8>,
}

/// Aggregated result of walking a full condition set.
#[derive(Debug, Clone, Default)]
pub struct ConditionMatchResult {
    pub matches: bool,
    pub reason: Option<String>,
    pub matched_conditions: Vec<String>,
    pub failed_conditions: Vec<String>,
}

impl ConditionMatchResult {
    fn new() -> Self {
        ConditionMatchResult {
            matches: true,
            ..Default::default()
        }
    }

    fn record(&mut self, name: &str, outcome: Match) {
        match outcome {
            (true, _) => self.matched_conditions.push(name.to_string()),
            (false, reason) => {
                self.matches = false;
                let reason = reason.unwrap_or_else(|| format!("{} did not match", name));
                self.failed_conditions.push(format!("{}: {}", name, reason));
                if self.reason.is_none() {
                    self.reason = Some(reason);
                }
            }
        }
    }
}

/// Walk every condition present in the set and record matched/failed keys.
/// Empty conditions always match.
pub fn match_conditions(conditions: &RuleConditions, ctx: &ConditionContext) -> ConditionMatchResult {
    let mut result = ConditionMatchResult::new();

    if conditions.environments.is_some() {
        result.record(
            &format!("environment={}", ctx.environment),
            matches_environment(&ctx.environment, conditions.environments.as_deref(), None),
        );
    }
    if conditions.apps.is_some() {
        result.record(
            &format!("app={}", ctx.app_id),
            matches_app(&ctx.app_id, conditions.apps.as_deref()),
        );
    }
    if conditions.features.is_some() {
        result.record(
            "feature",
            matches_feature(ctx.feature.as_deref(), conditions.features.as_deref()),
        );
    }
    if conditions.models.is_some() || conditions.blocked_models.is_some() {
        result.record(
            &format!("model={}", ctx.model),
            matches_model(
                &ctx.model,
                conditions.models.as_deref(),
                conditions.blocked_models.as_deref(),
            ),
        );
    }
    if conditions.max_tokens.is_some() || conditions.max_context_tokens.is_some() {
        result.record(
            "tokens",
            matches_tokens(
                ctx.input_tokens,
                ctx.max_tokens,
                conditions.max_context_tokens,
                conditions.max_tokens,
                None,
            ),
        );
    }
    if conditions.allowed_hours.is_some() {
        result.record("time", matches_time(conditions.allowed_hours, ctx.current_hour));
    }

    result
}
