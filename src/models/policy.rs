use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Action taken when a policy rule matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    Allow,
    Warn,
    Deny,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Warn => "warn",
            PolicyAction::Deny => "deny",
        }
    }
}

/// Parsed, validated form of the `conditions` JSON blob on a policy rule.
///
/// The vocabulary is closed. Persisted conditions may use plural or singular
/// key names (`environments` / `environment`); both are normalised here at
/// load time so `evaluate` never touches raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environments: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_models: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_context_tokens: Option<u32>,
    /// `(start_hour, end_hour)` inclusive; wrap-around when start > end.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_hours: Option<(u8, u8)>,
}

/// Keys the closed vocabulary admits, including singular and `allowed_*`
/// synonyms that older admin clients wrote.
const KNOWN_KEYS: &[&str] = &[
    "environments",
    "environment",
    "allowed_environments",
    "apps",
    "app_id",
    "features",
    "feature",
    "models",
    "model",
    "allowed_models",
    "blocked_models",
    "max_tokens",
    "max_context_tokens",
    "allowed_hours",
];

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConditionParseError {
    #[error("conditions must be a JSON object")]
    NotAnObject,
    #[error("unknown condition key '{0}'")]
    UnknownKey(String),
    #[error("condition '{key}' has invalid value")]
    InvalidValue { key: String },
}

impl RuleConditions {
    /// Parse a persisted conditions blob. Unknown keys are ignored for
    /// forward compatibility; use [`RuleConditions::parse_strict`] at admin
    /// write time to reject them.
    pub fn from_value(value: &Value) -> Result<RuleConditions, ConditionParseError> {
        Self::parse(value, false)
    }

    /// Like [`RuleConditions::from_value`], but unknown keys are an error.
    pub fn parse_strict(value: &Value) -> Result<RuleConditions, ConditionParseError> {
        Self::parse(value, true)
    }

    fn parse(value: &Value, strict: bool) -> Result<RuleConditions, ConditionParseError> {
        let obj = value.as_object().ok_or(ConditionParseError::NotAnObject)?;

        let mut out = RuleConditions::default();
        for (key, v) in obj {
            // Explicit nulls mean "no restriction", same as an absent key
            if v.is_null() {
                continue;
            }
            match key.as_str() {
                "environments" | "environment" | "allowed_environments" => {
                    out.environments = Some(string_list(key, v)?);
                }
                "apps" | "app_id" => {
                    out.apps = Some(string_list(key, v)?);
                }
                "features" | "feature" => {
                    out.features = Some(string_list(key, v)?);
                }
                "models" | "model" | "allowed_models" => {
                    out.models = Some(string_list(key, v)?);
                }
                "blocked_models" => {
                    out.blocked_models = Some(string_list(key, v)?);
                }
                "max_tokens" => {
                    out.max_tokens = Some(uint(key, v)?);
                }
                "max_context_tokens" => {
                    out.max_context_tokens = Some(uint(key, v)?);
                }
                "allowed_hours" => {
                    out.allowed_hours = Some(hour_pair(key, v)?);
                }
                other => {
                    if strict && !KNOWN_KEYS.contains(&other) {
                        return Err(ConditionParseError::UnknownKey(other.to_string()));
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn is_empty(&self) -> bool {
        *self == RuleConditions::default()
    }
}

fn string_list(key: &str, v: &Value) -> Result<Vec<String>, ConditionParseError> {
    match v {
        // Singular keys may carry a bare string
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str()
                    .map(String::from)
                    .ok_or(ConditionParseError::InvalidValue { key: key.to_string() })
            })
            .collect(),
        _ => Err(ConditionParseError::InvalidValue { key: key.to_string() }),
    }
}

fn uint(key: &str, v: &Value) -> Result<u32, ConditionParseError> {
    v.as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(ConditionParseError::InvalidValue { key: key.to_string() })
}

fn hour_pair(key: &str, v: &Value) -> Result<(u8, u8), ConditionParseError> {
    let arr = v
        .as_array()
        .ok_or(ConditionParseError::InvalidValue { key: key.to_string() })?;
    if arr.len() != 2 {
        return Err(ConditionParseError::InvalidValue { key: key.to_string() });
    }
    let h = |i: usize| -> Result<u8, ConditionParseError> {
        arr[i]
            .as_u64()
            .filter(|n| *n <= 23)
            .map(|n| n as u8)
            .ok_or(ConditionParseError::InvalidValue { key: key.to_string() })
    };
    Ok((h(0)?, h(1)?))
}

/// An ordered, priority-weighted governance rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: Uuid,
    pub name: String,
    /// Higher priority rules are evaluated first.
    pub priority: i32,
    pub enabled: bool,
    pub action: PolicyAction,
    pub conditions: RuleConditions,
    /// None ⇒ global rule shared by every application.
    pub application_id: Option<String>,
}

impl PolicyRule {
    pub fn new(name: &str, priority: i32, action: PolicyAction, conditions: RuleConditions) -> Self {
        PolicyRule {
            id: Uuid::new_v4(),
            name: name.to_string(),
            priority,
            enabled: true,
            action,
            conditions,
            application_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_plural_keys() {
        let c = RuleConditions::from_value(&json!({
            "environments": ["production"],
            "models": ["gpt-*"],
            "max_tokens": 4000,
            "allowed_hours": [9, 17],
        }))
        .unwrap();
        assert_eq!(c.environments, Some(vec!["production".to_string()]));
        assert_eq!(c.models, Some(vec!["gpt-*".to_string()]));
        assert_eq!(c.max_tokens, Some(4000));
        assert_eq!(c.allowed_hours, Some((9, 17)));
    }

    #[test]
    fn test_singular_keys_normalise_to_plural() {
        let c = RuleConditions::from_value(&json!({
            "environment": "staging",
            "model": "claude-3-opus",
            "feature": "chat",
        }))
        .unwrap();
        assert_eq!(c.environments, Some(vec!["staging".to_string()]));
        assert_eq!(c.models, Some(vec!["claude-3-opus".to_string()]));
        assert_eq!(c.features, Some(vec!["chat".to_string()]));
    }

    #[test]
    fn test_allowed_synonyms() {
        let c = RuleConditions::from_value(&json!({
            "allowed_environments": ["production"],
            "allowed_models": ["gpt-4o"],
        }))
        .unwrap();
        assert_eq!(c.environments, Some(vec!["production".to_string()]));
        assert_eq!(c.models, Some(vec!["gpt-4o".to_string()]));
    }

    #[test]
    fn test_unknown_key_ignored_at_runtime() {
        let c = RuleConditions::from_value(&json!({"future_key": true, "models": ["m"]})).unwrap();
        assert_eq!(c.models, Some(vec!["m".to_string()]));
    }

    #[test]
    fn test_unknown_key_rejected_at_write_time() {
        let err = RuleConditions::parse_strict(&json!({"future_key": true})).unwrap_err();
        assert_eq!(err, ConditionParseError::UnknownKey("future_key".into()));
    }

    #[test]
    fn test_invalid_hours_rejected() {
        assert!(RuleConditions::from_value(&json!({"allowed_hours": [9]})).is_err());
        assert!(RuleConditions::from_value(&json!({"allowed_hours": [9, 25]})).is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let c = RuleConditions::from_value(&json!({"models": ["gpt-*"], "max_tokens": 100})).unwrap();
        let persisted = serde_json::to_value(&c).unwrap();
        // None fields are omitted, so a round trip parses cleanly
        assert!(persisted.get("environments").is_none());
        assert_eq!(RuleConditions::from_value(&persisted).unwrap(), c);
    }

    #[test]
    fn test_explicit_null_means_no_restriction() {
        let c = RuleConditions::from_value(&json!({"models": null, "max_tokens": 50})).unwrap();
        assert!(c.models.is_none());
        assert_eq!(c.max_tokens, Some(50));
    }

    #[test]
    fn test_not_an_object() {
        assert_eq!(
            RuleConditions::from_value(&json!([1, 2])).unwrap_err(),
            ConditionParseError::NotAnObject
        );
    }

    #[test]
    fn test_action_serde_lowercase() {
        assert_eq!(serde_json::to_string(&PolicyAction::Deny).unwrap(), "\"deny\"");
        let a: PolicyAction = serde_json::from_str("\"warn\"").unwrap();
        assert_eq!(a, PolicyAction::Warn);
    }
}
