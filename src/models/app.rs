use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered client identity. Owns API credentials, budgets, features,
/// and application-scoped policy rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Application {
    pub id: i64,
    pub uuid: Uuid,
    /// Stable slug-cased identifier, 3–100 chars, unique.
    pub app_id: String,
    pub name: String,
    pub owner: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub allowed_providers: Vec<String>,
    /// Empty ⇒ no app-level model restriction.
    pub allowed_models: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// An API credential belonging to exactly one application.
///
/// Only the SHA-256 hash of the opaque key is stored; the plaintext is
/// returned once at creation and never again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiCredential {
    pub id: i64,
    pub application_id: i64,
    pub key_hash: String,
    /// First 12 chars of the plaintext key, for identification.
    pub key_prefix: String,
    pub name: String,
    pub environment: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Optional encrypted passthrough key to the LLM provider (byo-key mode).
    pub encrypted_provider_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The resolved view of a credential + its application, as cached under
/// `auth:credentials:<sha256>` and carried through the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedCredentials {
    pub app_id: String,
    pub api_key_id: i64,
    pub key_prefix: String,
    pub environment: String,
    pub is_active: bool,
    pub app_is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed_providers: Vec<String>,
    pub allowed_models: Vec<String>,
    /// Passthrough provider key from the Authorization header.
    /// Never cached, never logged.
    #[serde(skip)]
    pub provider_api_key: Option<String>,
}

/// Validate an `app_id` slug: 3–100 chars of lowercase alphanumerics and dashes.
pub fn valid_app_id(app_id: &str) -> bool {
    let len = app_id.chars().count();
    (3..=100).contains(&len)
        && app_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_app_id() {
        assert!(valid_app_id("test-app"));
        assert!(valid_app_id("app_01"));
        assert!(!valid_app_id("ab"));
        assert!(!valid_app_id("My App"));
        assert!(!valid_app_id(&"x".repeat(101)));
    }

    #[test]
    fn test_provider_key_is_not_serialized() {
        let creds = ResolvedCredentials {
            app_id: "test-app".into(),
            api_key_id: 1,
            key_prefix: "gw_abcdefgh".into(),
            environment: "development".into(),
            is_active: true,
            app_is_active: true,
            expires_at: None,
            allowed_providers: vec!["openai".into()],
            allowed_models: vec![],
            provider_api_key: Some("sk-secret".into()),
        };
        let json = serde_json::to_string(&creds).unwrap();
        assert!(!json.contains("sk-secret"));
    }
}
