/// Unified error types for calsync
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Classified failure from a provider adapter.
///
/// Adapters map raw HTTP/transport failures onto these variants before the
/// error leaves the adapter, so callers decide retry policy by variant only.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    /// Network failure or 5xx
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// 429, or 403 with a provider rate-limit reason
    #[error("provider rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    /// Credential rejected or refresh denied
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    /// Sync token / delta link is stale (410 Gone)
    #[error("incremental cursor invalidated")]
    CursorInvalidated,

    /// Payload could not be parsed
    #[error("malformed provider payload: {0}")]
    Malformed(String),

    /// Any other 4xx
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Capability not offered by this provider
    #[error("operation not supported by provider: {0}")]
    Unsupported(&'static str),
}

impl ProviderError {
    /// Classify a non-success HTTP response.
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => ProviderError::Unauthorized(truncate(body)),
            410 => ProviderError::CursorInvalidated,
            429 => ProviderError::RateLimited { retry_after: None },
            403 if is_rate_limit_reason(body) => ProviderError::RateLimited { retry_after: None },
            500..=599 => ProviderError::Transient(format!("HTTP {}", status)),
            _ => ProviderError::Rejected {
                status,
                message: truncate(body),
            },
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transient(_) | ProviderError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), "")
        } else {
            ProviderError::Transient(err.to_string())
        }
    }
}

fn is_rate_limit_reason(body: &str) -> bool {
    body.contains("rateLimitExceeded")
        || body.contains("userRateLimitExceeded")
        || body.contains("quotaExceeded")
}

fn truncate(body: &str) -> String {
    body.chars().take(300).collect()
}

/// Main error type for the service
#[derive(Error, Debug)]
pub enum CalError {
    /// Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Authentication errors
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Authorization errors
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Not found errors
    #[error("Not found: {0}")]
    NotFound(String),

    /// Conflict errors (e.g., sync already running)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Stored credential unusable; the user has to reconnect the account
    #[error("Reconnect required: {0}")]
    ReauthorizationRequired(String),

    /// Classified provider failure
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Cache or lock backend errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Rate limiting errors
    #[error("Rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    /// Wall-clock budget exceeded
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JWT errors
    #[error("JWT error: {0}")]
    Jwt(String),
}

impl CalError {
    /// True for failures that must stop the sync and surface a reconnect action.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(
            self,
            CalError::ReauthorizationRequired(_)
                | CalError::Provider(ProviderError::Unauthorized(_))
        )
    }

    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            CalError::Provider(err) => err.is_transient(),
            CalError::Timeout(_) | CalError::Cache(_) => true,
            _ => false,
        }
    }

    /// Short message stored on the account when a sync fails.
    pub fn user_message(&self) -> String {
        if self.requires_reauthorization() {
            "Access to this calendar was revoked or expired. Please reconnect the account."
                .to_string()
        } else {
            match self {
                CalError::Provider(ProviderError::RateLimited { .. }) => {
                    "The calendar provider is rate limiting requests. Sync will retry later."
                        .to_string()
                }
                CalError::Timeout(_) => "Sync took too long and was stopped.".to_string(),
                CalError::Provider(err) => format!("Calendar provider error: {}", err),
                _ => "Sync failed due to an internal error.".to_string(),
            }
        }
    }
}

impl From<redis::RedisError> for CalError {
    fn from(err: redis::RedisError) -> Self {
        CalError::Cache(err.to_string())
    }
}

impl From<serde_json::Error> for CalError {
    fn from(err: serde_json::Error) -> Self {
        CalError::Internal(format!("JSON error: {}", err))
    }
}

impl From<jsonwebtoken::errors::Error> for CalError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        CalError::Jwt(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for CalError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CalError::Internal(format!("Migration failed: {}", err))
    }
}

impl From<validator::ValidationErrors> for CalError {
    fn from(err: validator::ValidationErrors) -> Self {
        CalError::Validation(err.to_string())
    }
}

/// JSON error body returned by the API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Convert CalError to HTTP response
impl IntoResponse for CalError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            CalError::Authentication(_) | CalError::Jwt(_) => (
                StatusCode::UNAUTHORIZED,
                "AuthenticationRequired",
                self.to_string(),
            ),
            CalError::Authorization(_) => (StatusCode::FORBIDDEN, "Forbidden", self.to_string()),
            CalError::Validation(_) => (
                StatusCode::BAD_REQUEST,
                "InvalidRequest",
                self.to_string(),
            ),
            CalError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound", self.to_string()),
            CalError::Conflict(_) => (StatusCode::CONFLICT, "Conflict", self.to_string()),
            CalError::ReauthorizationRequired(_) => (
                StatusCode::CONFLICT,
                "ReconnectRequired",
                self.user_message(),
            ),
            CalError::RateLimitExceeded { .. } => (
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimitExceeded",
                "Rate limit exceeded".to_string(),
            ),
            CalError::Provider(_) => (
                StatusCode::BAD_GATEWAY,
                "ProviderError",
                self.user_message(),
            ),
            CalError::Timeout(_) => (
                StatusCode::GATEWAY_TIMEOUT,
                "Timeout",
                self.to_string(),
            ),
            CalError::Database(_) | CalError::Internal(_) | CalError::Io(_) | CalError::Cache(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "InternalServerError",
                "Internal server error".to_string(), // Don't leak details
            ),
        };

        let body = Json(ErrorResponse {
            error: error_code.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

/// Result type alias for service operations
pub type CalResult<T> = Result<T, CalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            ProviderError::from_status(401, "invalid_grant"),
            ProviderError::Unauthorized(_)
        ));
        assert_eq!(ProviderError::from_status(410, ""), ProviderError::CursorInvalidated);
        assert!(ProviderError::from_status(429, "").is_transient());
        assert!(ProviderError::from_status(503, "").is_transient());
        assert!(ProviderError::from_status(
            403,
            r#"{"error":{"errors":[{"reason":"rateLimitExceeded"}]}}"#
        )
        .is_transient());
        assert!(matches!(
            ProviderError::from_status(403, "forbidden"),
            ProviderError::Rejected { status: 403, .. }
        ));
    }

    #[test]
    fn test_reauthorization_policy() {
        let err = CalError::Provider(ProviderError::Unauthorized("revoked".into()));
        assert!(err.requires_reauthorization());
        assert!(!err.is_transient());

        let err = CalError::ReauthorizationRequired("decrypt failed".into());
        assert!(err.requires_reauthorization());
        assert!(err.user_message().contains("reconnect"));

        let err = CalError::Provider(ProviderError::Transient("reset".into()));
        assert!(err.is_transient());
        assert!(!err.requires_reauthorization());
    }
}
