use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Gateway-level error. The `IntoResponse` impl below is the only place
/// internal outcomes are mapped to HTTP statuses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("authentication failed: {message}")]
    Auth {
        code: &'static str,
        message: String,
    },

    #[error("invalid request: {0}")]
    Contract(String),

    #[error("feature denied: {message}")]
    FeatureDenied {
        code: String,
        message: String,
        decision_chain: serde_json::Value,
    },

    #[error("policy denied: {message}")]
    PolicyDenied {
        code: String,
        message: String,
        decision_chain: serde_json::Value,
    },

    #[error("budget denied: {message}")]
    BudgetDenied {
        code: String,
        message: String,
        decision_chain: serde_json::Value,
    },

    #[error("abuse detected: {message}")]
    AbuseDenied {
        message: String,
        cooldown_seconds: Option<u64>,
    },

    #[error("upstream provider error: {0}")]
    Provider(String),

    #[error("upstream provider timed out")]
    ProviderTimeout,

    #[error("dependency unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("duplicate request: {0}")]
    Conflict(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, msg, chain) = match &self {
            AppError::Auth { code, message } => {
                (StatusCode::UNAUTHORIZED, code.to_string(), message.clone(), None)
            }
            AppError::Contract(msg) => (
                StatusCode::BAD_REQUEST,
                "CONTRACT_INVALID".to_string(),
                msg.clone(),
                None,
            ),
            AppError::FeatureDenied {
                code,
                message,
                decision_chain,
            } => (
                StatusCode::FORBIDDEN,
                code.clone(),
                message.clone(),
                Some(decision_chain.clone()),
            ),
            AppError::PolicyDenied {
                code,
                message,
                decision_chain,
            } => (
                StatusCode::FORBIDDEN,
                code.clone(),
                message.clone(),
                Some(decision_chain.clone()),
            ),
            AppError::BudgetDenied {
                code,
                message,
                decision_chain,
            } => (
                StatusCode::PAYMENT_REQUIRED,
                code.clone(),
                message.clone(),
                Some(decision_chain.clone()),
            ),
            AppError::AbuseDenied { message, .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "DENIED_ABUSE".to_string(),
                message.clone(),
                None,
            ),
            AppError::Provider(msg) => (
                StatusCode::BAD_GATEWAY,
                "PROVIDER_ERROR".to_string(),
                msg.clone(),
                None,
            ),
            AppError::ProviderTimeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "PROVIDER_TIMEOUT".to_string(),
                "upstream provider timed out".to_string(),
                None,
            ),
            AppError::ServiceUnavailable(dep) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "SERVICE_UNAVAILABLE".to_string(),
                format!("dependency '{}' is unavailable", dep),
                None,
            ),
            AppError::Conflict(msg) => (
                StatusCode::CONFLICT,
                "DUPLICATE_REQUEST".to_string(),
                msg.clone(),
                None,
            ),
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR".to_string(),
                    "internal server error".to_string(),
                    None,
                )
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR".to_string(),
                    "internal server error".to_string(),
                    None,
                )
            }
        };

        let mut error = json!({
            "code": code,
            "message": msg,
        });
        if let Some(chain) = chain {
            error["decision_chain"] = chain;
        }

        let body = Json(json!({ "error": error }));
        let mut response = (status, body).into_response();

        if let AppError::AbuseDenied {
            cooldown_seconds: Some(secs),
            ..
        } = self
        {
            if let Ok(val) = axum::http::HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert("retry-after", val);
            }
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_denial_maps_to_402() {
        let err = AppError::BudgetDenied {
            code: "BUDGET_HARD_LIMIT_EXCEEDED".into(),
            message: "budget exceeded".into(),
            decision_chain: json!([]),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn test_policy_denial_maps_to_403() {
        let err = AppError::PolicyDenied {
            code: "POLICY_MODEL_BLOCKED".into(),
            message: "model blocked".into(),
            decision_chain: json!([]),
        };
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_auth_maps_to_401() {
        let err = AppError::Auth {
            code: "AUTH_INVALID_KEY",
            message: "invalid API key".into(),
        };
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_timeout_maps_to_504() {
        assert_eq!(
            AppError::ProviderTimeout.into_response().status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_unavailable_maps_to_503() {
        assert_eq!(
            AppError::ServiceUnavailable("database".into())
                .into_response()
                .status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_abuse_carries_retry_after() {
        let err = AppError::AbuseDenied {
            message: "retry loop".into(),
            cooldown_seconds: Some(30),
        };
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").unwrap(), "30");
    }
}
