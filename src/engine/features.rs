//! Feature allowlist checks.
//!
//! The decision ladder runs against a per-application registry snapshot
//! loaded by the repository. Decision codes are stable strings — they appear
//! in audit logs and in the dashboard.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::conditions::matches_model;
use crate::models::feature::{AppFeatureRegistry, FeatureAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDecision {
    Allowed,
    AllowedNoRegistry,
    AllowedPermissive,
    DeniedNoFeatureSpecified,
    DeniedUnknownFeature,
    DeniedFeatureDisabled,
    DeniedActionNotAllowed,
    DeniedModelNotAllowed,
    DeniedEnvironmentNotAllowed,
    DeniedTokenLimit,
    DeniedCostLimit,
}

impl FeatureDecision {
    pub fn code(&self) -> &'static str {
        match self {
            FeatureDecision::Allowed => "ALLOWED",
            FeatureDecision::AllowedNoRegistry => "ALLOWED_NO_REGISTRY",
            FeatureDecision::AllowedPermissive => "ALLOWED_PERMISSIVE",
            FeatureDecision::DeniedNoFeatureSpecified => "DENIED_NO_FEATURE_SPECIFIED",
            FeatureDecision::DeniedUnknownFeature => "DENIED_UNKNOWN_FEATURE",
            FeatureDecision::DeniedFeatureDisabled => "DENIED_FEATURE_DISABLED",
            FeatureDecision::DeniedActionNotAllowed => "DENIED_ACTION_NOT_ALLOWED",
            FeatureDecision::DeniedModelNotAllowed => "DENIED_MODEL_NOT_ALLOWED",
            FeatureDecision::DeniedEnvironmentNotAllowed => "DENIED_ENVIRONMENT_NOT_ALLOWED",
            FeatureDecision::DeniedTokenLimit => "DENIED_TOKEN_LIMIT",
            FeatureDecision::DeniedCostLimit => "DENIED_COST_LIMIT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureCheckResult {
    pub allowed: bool,
    pub decision: FeatureDecision,
    pub reason: String,
    pub feature_id: Option<String>,
    pub feature_name: Option<String>,
    /// Caps that will be enforced downstream, echoed back to the caller.
    pub applied_constraints: Value,
    pub warnings: Vec<String>,
}

impl FeatureCheckResult {
    fn allowed(decision: FeatureDecision, reason: &str) -> Self {
        FeatureCheckResult {
            allowed: true,
            decision,
            reason: reason.to_string(),
            feature_id: None,
            feature_name: None,
            applied_constraints: Value::Null,
            warnings: vec![],
        }
    }

    fn denied(decision: FeatureDecision, reason: String, feature_id: Option<String>) -> Self {
        FeatureCheckResult {
            allowed: false,
            decision,
            reason,
            feature_id,
            feature_name: None,
            applied_constraints: Value::Null,
            warnings: vec![],
        }
    }
}

/// Run the feature decision ladder for one request.
pub fn check_feature(
    registry: Option<&AppFeatureRegistry>,
    feature_id: Option<&str>,
    action: FeatureAction,
    model: &str,
    environment: &str,
    estimated_tokens: Option<u32>,
    estimated_cost_usd: Option<Decimal>,
) -> FeatureCheckResult {
    // 1. No registry for the app ⇒ permissive
    let Some(registry) = registry else {
        return FeatureCheckResult::allowed(
            FeatureDecision::AllowedNoRegistry,
            "No feature registry for application",
        );
    };

    // 2. Resolve the effective feature id
    let effective_id = feature_id
        .map(String::from)
        .or_else(|| registry.default_feature_id.clone());
    let Some(effective_id) = effective_id else {
        if registry.strict {
            return FeatureCheckResult::denied(
                FeatureDecision::DeniedNoFeatureSpecified,
                "No feature specified and registry is strict".to_string(),
                None,
            );
        }
        let mut result = FeatureCheckResult::allowed(
            FeatureDecision::AllowedPermissive,
            "No feature specified; registry is permissive",
        );
        result.warnings.push("Request carried no feature id".to_string());
        return result;
    };

    // 3. Look up the definition
    let Some(def) = registry.features.get(&effective_id) else {
        if registry.strict {
            return FeatureCheckResult::denied(
                FeatureDecision::DeniedUnknownFeature,
                format!("Unknown feature '{}'", effective_id),
                Some(effective_id),
            );
        }
        let mut result = FeatureCheckResult::allowed(
            FeatureDecision::AllowedPermissive,
            "Unknown feature; registry is permissive",
        );
        result.feature_id = Some(effective_id.clone());
        result.warnings.push(format!("Feature '{}' is not registered", effective_id));
        return result;
    };

    // 4. Disabled
    if !def.is_active {
        return FeatureCheckResult::denied(
            FeatureDecision::DeniedFeatureDisabled,
            format!("Feature '{}' is disabled", effective_id),
            Some(effective_id),
        );
    }

    // 5. Action allowlist
    if !def.allowed_actions.contains(&action) {
        return FeatureCheckResult::denied(
            FeatureDecision::DeniedActionNotAllowed,
            format!("Action '{}' not allowed for feature '{}'", action.as_str(), effective_id),
            Some(effective_id),
        );
    }

    // 6. Model allowlist (empty ⇒ inherit app policy)
    if !def.allowed_models.is_empty() {
        let (ok, _) = matches_model(model, Some(&def.allowed_models), None);
        if !ok {
            return FeatureCheckResult::denied(
                FeatureDecision::DeniedModelNotAllowed,
                format!("Model '{}' not allowed for feature '{}'", model, effective_id),
                Some(effective_id),
            );
        }
    }

    // 7. Environment
    if !def.allowed_environments.iter().any(|e| e == environment) {
        return FeatureCheckResult::denied(
            FeatureDecision::DeniedEnvironmentNotAllowed,
            format!("Environment '{}' not allowed for feature '{}'", environment, effective_id),
            Some(effective_id),
        );
    }

    // 8. Token cap
    if let (Some(est), Some(max)) = (estimated_tokens, def.max_tokens_per_request) {
        if est > max {
            return FeatureCheckResult::denied(
                FeatureDecision::DeniedTokenLimit,
                format!("Estimated tokens {} exceed feature cap {}", est, max),
                Some(effective_id),
            );
        }
    }

    // 9. Cost cap
    if let (Some(est), Some(max)) = (estimated_cost_usd, def.max_cost_per_request_usd) {
        if est > max {
            return FeatureCheckResult::denied(
                FeatureDecision::DeniedCostLimit,
                format!("Estimated cost ${} exceeds feature cap ${}", est, max),
                Some(effective_id),
            );
        }
    }

    // 10. Allowed; echo the caps enforced downstream
    let mut result = FeatureCheckResult::allowed(FeatureDecision::Allowed, "Feature allowed");
    result.feature_id = Some(effective_id);
    result.feature_name = Some(def.name.clone());
    result.applied_constraints = json!({
        "max_tokens_per_request": def.max_tokens_per_request,
        "max_cost_per_request_usd": def.max_cost_per_request_usd,
        "max_requests_per_minute": def.max_requests_per_minute,
        "allow_pii": def.allow_pii,
        "require_data_separation": def.require_data_separation,
    });
    result
}
