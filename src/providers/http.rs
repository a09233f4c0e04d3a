/// Shared HTTP plumbing for provider adapters
use crate::error::{CalError, CalResult, ProviderError};
use reqwest::{header::RETRY_AFTER, Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("calsync/", env!("CARGO_PKG_VERSION"));

pub fn build_client() -> CalResult<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| CalError::Internal(format!("Failed to build HTTP client: {}", e)))
}

/// Pass successful responses through; classify everything else.
pub async fn check(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    debug!(status = status.as_u16(), "provider request failed");

    match ProviderError::from_status(status.as_u16(), &body) {
        ProviderError::RateLimited { .. } => Err(ProviderError::RateLimited { retry_after }),
        other => Err(other),
    }
}

/// Check the status and decode a JSON body.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> CalResult<T> {
    let response = check(response).await?;
    let text = response.text().await.map_err(ProviderError::from)?;
    serde_json::from_str(&text)
        .map_err(|e| CalError::Provider(ProviderError::Malformed(e.to_string())))
}

/// Send a request and map transport failures to transient errors.
pub async fn send(request: reqwest::RequestBuilder) -> CalResult<Response> {
    let response = request.send().await.map_err(ProviderError::from)?;
    Ok(response)
}

/// Token endpoint failures: 400/401 mean the grant is dead.
pub async fn read_token_json<T: DeserializeOwned>(response: Response) -> CalResult<T> {
    let status = response.status().as_u16();
    if status == 400 || status == 401 {
        let body = response.text().await.unwrap_or_default();
        return Err(CalError::ReauthorizationRequired(format!(
            "token endpoint rejected grant ({}): {}",
            status,
            body.chars().take(200).collect::<String>()
        )));
    }
    read_json(response).await
}
