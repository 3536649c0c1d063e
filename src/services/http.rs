//! Request plumbing shared by the remote chat providers

use crate::error::{ProviderError, Result};
use reqwest::StatusCode;
use std::time::Duration;

/// Resolve an API key: explicit value first, then the environment variable
#[must_use]
pub fn resolve_api_key(explicit: Option<&str>, env: &str) -> Option<String> {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var(env).ok())
        .filter(|key| !key.trim().is_empty())
}

/// Map a non-success HTTP status to a provider error
#[must_use]
pub fn error_for_status(status: StatusCode, body: &str) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::InvalidApiKey,
        StatusCode::TOO_MANY_REQUESTS => ProviderError::QuotaExceeded,
        StatusCode::BAD_REQUEST => ProviderError::ApiError(format!("Bad request: {body}")),
        _ => ProviderError::ApiError(format!("API error ({status}): {body}")),
    }
}

/// Send a prepared request and decode the JSON body of a successful response
pub async fn send_json(
    request: reqwest::RequestBuilder,
    timeout: Option<Duration>,
) -> Result<serde_json::Value> {
    let request = match timeout {
        Some(timeout) => request.timeout(timeout),
        None => request,
    };

    let response = request
        .send()
        .await
        .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(error_for_status(status, &body).into());
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::ApiError(format!("Failed to parse response: {e}")).into())
}
