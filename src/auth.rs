/// Bearer token authentication for the inbound API
///
/// Tokens are HS256 JWTs issued by the surrounding application; `sub`
/// carries the user id.
use crate::{context::AppContext, error::CalError};
use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// Allowed clock skew in seconds
const LEEWAY_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    #[serde(default)]
    pub iat: Option<i64>,
}

/// Extract bearer token from Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Verify signature and expiry, returning the claims
pub fn verify_token(token: &str, secret: &str) -> Result<Claims, CalError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = LEEWAY_SECS;

    let data = decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map_err(|e| {
            tracing::debug!("JWT verification failed: {}", e);
            match e.kind() {
                ErrorKind::ExpiredSignature => {
                    CalError::Authentication("Token has expired".to_string())
                }
                ErrorKind::InvalidSignature => {
                    CalError::Authentication("Invalid token signature".to_string())
                }
                _ => CalError::Authentication("Invalid token".to_string()),
            }
        })?;

    if data.claims.sub.is_empty() {
        return Err(CalError::Authentication("Token has no subject".to_string()));
    }
    Ok(data.claims)
}

/// Authenticated caller
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
}

#[async_trait]
impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = CalError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| CalError::Authentication("Missing authorization header".to_string()))?;

        let claims = verify_token(token, &state.config.authentication.jwt_secret)?;
        Ok(AuthUser {
            user_id: claims.sub,
        })
    }
}

/// Sign a token for `user_id`, valid for `ttl_secs`
#[cfg(test)]
pub fn issue_token(user_id: &str, secret: &str, ttl_secs: i64) -> String {
    use jsonwebtoken::{encode, EncodingKey, Header};

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user_id.to_string(),
        exp: now + ttl_secs,
        iat: Some(now),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}
