use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use rust_decimal::Decimal;

/// Closed set of actions a feature can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureAction {
    Chat,
    Completion,
    Embedding,
    Summarization,
    Classification,
    Extraction,
    Translation,
    CodeGeneration,
    CodeReview,
    Analysis,
    Custom,
}

impl FeatureAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureAction::Chat => "chat",
            FeatureAction::Completion => "completion",
            FeatureAction::Embedding => "embedding",
            FeatureAction::Summarization => "summarization",
            FeatureAction::Classification => "classification",
            FeatureAction::Extraction => "extraction",
            FeatureAction::Translation => "translation",
            FeatureAction::CodeGeneration => "code_generation",
            FeatureAction::CodeReview => "code_review",
            FeatureAction::Analysis => "analysis",
            FeatureAction::Custom => "custom",
        }
    }
}

fn all_environments() -> Vec<String> {
    vec!["development".into(), "staging".into(), "production".into()]
}

/// A declared use-case bucket constraining models, actions, environments,
/// tokens, and cost per request for an application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub allowed_actions: Vec<FeatureAction>,
    /// Empty ⇒ inherit app-level model policy.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default = "all_environments")]
    pub allowed_environments: Vec<String>,
    pub max_tokens_per_request: Option<u32>,
    pub max_cost_per_request_usd: Option<Decimal>,
    pub max_requests_per_minute: Option<u32>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub allow_pii: bool,
    #[serde(default = "default_true")]
    pub require_data_separation: bool,
}

fn default_true() -> bool {
    true
}

impl FeatureDefinition {
    pub fn new(id: &str, name: &str) -> Self {
        FeatureDefinition {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            allowed_actions: vec![FeatureAction::Chat],
            allowed_models: vec![],
            allowed_environments: all_environments(),
            max_tokens_per_request: None,
            max_cost_per_request_usd: None,
            max_requests_per_minute: None,
            is_active: true,
            allow_pii: false,
            require_data_separation: true,
        }
    }
}

/// Per-application feature registry: the set of declared features plus the
/// registry mode. In strict mode a feature id is required and must be known;
/// in permissive mode missing/unknown features are warned but allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppFeatureRegistry {
    pub app_id: String,
    pub strict: bool,
    pub default_feature_id: Option<String>,
    pub features: HashMap<String, FeatureDefinition>,
}

impl AppFeatureRegistry {
    pub fn new(app_id: &str) -> Self {
        AppFeatureRegistry {
            app_id: app_id.to_string(),
            strict: false,
            default_feature_id: None,
            features: HashMap::new(),
        }
    }

    pub fn with_feature(mut self, feature: FeatureDefinition) -> Self {
        self.features.insert(feature.id.clone(), feature);
        self
    }

    pub fn strict(mut self) -> Self {
        self.strict = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_defaults() {
        let f = FeatureDefinition::new("chat", "Chat");
        assert!(f.is_active);
        assert!(!f.allow_pii);
        assert!(f.require_data_separation);
        assert_eq!(f.allowed_environments.len(), 3);
    }

    #[test]
    fn test_action_serde_snake_case() {
        assert_eq!(
            serde_json::to_string(&FeatureAction::CodeGeneration).unwrap(),
            "\"code_generation\""
        );
        let a: FeatureAction = serde_json::from_str("\"embedding\"").unwrap();
        assert_eq!(a, FeatureAction::Embedding);
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let f: FeatureDefinition =
            serde_json::from_str(r#"{"id": "summarize", "name": "Summaries"}"#).unwrap();
        assert!(f.is_active);
        assert_eq!(f.allowed_environments, vec!["development", "staging", "production"]);
        assert!(f.allowed_models.is_empty());
    }

    #[test]
    fn test_registry_builder() {
        let reg = AppFeatureRegistry::new("test-app")
            .with_feature(FeatureDefinition::new("chat", "Chat"))
            .strict();
        assert!(reg.strict);
        assert!(reg.features.contains_key("chat"));
    }
}
