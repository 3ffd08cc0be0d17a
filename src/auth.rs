//! API key authentication with a short-lived cached credential lookup.
//!
//! The opaque key from `X-API-Key` is hashed with SHA-256 and resolved via
//! the two-tier cache (`auth:credentials:<sha256>`, TTL 300 s), falling back
//! to the credential repository. The plaintext key is never logged or
//! persisted.

use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::cache::TieredCache;
use crate::engine::decision::codes;
use crate::models::app::ResolvedCredentials;
use crate::ports::CredentialRepository;

pub const CREDENTIALS_CACHE_TTL_SECS: u64 = 300;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AuthError {
    #[error("missing X-API-Key header")]
    MissingKey,
    #[error("invalid API key")]
    InvalidKey,
    #[error("API key expired")]
    ExpiredKey,
    #[error("API key or application is deactivated")]
    KeyDisabled,
}

impl AuthError {
    pub fn code(&self) -> &'static str {
        match self {
            AuthError::MissingKey => codes::AUTH_MISSING_KEY,
            AuthError::InvalidKey => codes::AUTH_INVALID_KEY,
            AuthError::ExpiredKey => codes::AUTH_EXPIRED_KEY,
            AuthError::KeyDisabled => codes::AUTH_KEY_DISABLED,
        }
    }
}

pub fn hash_api_key(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// First 12 chars of the plaintext key, for log-safe identification.
pub fn key_prefix(api_key: &str) -> &str {
    let end = api_key
        .char_indices()
        .nth(12)
        .map(|(i, _)| i)
        .unwrap_or(api_key.len());
    &api_key[..end]
}

fn cache_key(key_hash: &str) -> String {
    format!("auth:credentials:{}", key_hash)
}

pub struct Authenticator {
    cache: TieredCache,
    credentials: Arc<dyn CredentialRepository>,
}

impl Authenticator {
    pub fn new(cache: TieredCache, credentials: Arc<dyn CredentialRepository>) -> Self {
        Authenticator { cache, credentials }
    }

    /// Resolve an API key into credentials.
    ///
    /// `bearer` is the optional `Authorization: Bearer` passthrough provider
    /// key; it is attached to the result after the cached lookup and never
    /// cached itself.
    pub async fn authenticate(
        &self,
        api_key: Option<&str>,
        bearer: Option<&str>,
    ) -> Result<ResolvedCredentials, AuthError> {
        let api_key = api_key.ok_or(AuthError::MissingKey)?;
        if api_key.is_empty() {
            return Err(AuthError::MissingKey);
        }

        let key_hash = hash_api_key(api_key);
        let mut creds = match self.cache.get::<ResolvedCredentials>(&cache_key(&key_hash)).await {
            Some(cached) => cached,
            None => {
                let resolved = self
                    .credentials
                    .lookup_by_key_hash(&key_hash)
                    .await
                    .map_err(|e| {
                        tracing::error!(prefix = key_prefix(api_key), "credential lookup failed: {}", e);
                        AuthError::InvalidKey
                    })?
                    .ok_or(AuthError::InvalidKey)?;

                if let Err(e) = self
                    .cache
                    .set(&cache_key(&key_hash), &resolved, CREDENTIALS_CACHE_TTL_SECS)
                    .await
                {
                    tracing::warn!("credential cache write failed: {}", e);
                }
                resolved
            }
        };

        if !creds.is_active || !creds.app_is_active {
            return Err(AuthError::KeyDisabled);
        }
        if let Some(expires_at) = creds.expires_at {
            if expires_at < chrono::Utc::now() {
                return Err(AuthError::ExpiredKey);
            }
        }

        // Best-effort: a write failure must not fail auth
        if let Err(e) = self.credentials.touch_last_used(creds.api_key_id).await {
            tracing::warn!("last_used_at update failed: {}", e);
        }

        creds.provider_api_key = bearer.map(String::from);
        Ok(creds)
    }

    /// Drop a cached credential after mutation (rotate/deactivate/delete).
    pub async fn invalidate(&self, key_hash: &str) {
        if let Err(e) = self.cache.invalidate(&cache_key(key_hash)).await {
            tracing::warn!("credential cache invalidation failed: {}", e);
        }
    }
}
