//! Shared request/response handling for the provider clients

use reqwest::Response;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, SourceError};

/// Authorization header value for a bearer token
pub fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

/// Turn a non-success response into a `Network` error carrying the body
pub async fn check(response: Response, operation: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    debug!(operation = operation, status = status.as_u16(), "Provider request failed");
    Err(SourceError::from_status(operation, status.as_u16(), &body))
}

/// Check the response and decode its JSON body
pub async fn json<T: DeserializeOwned>(response: Response, operation: &str) -> Result<T> {
    let response = check(response, operation).await?;
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| SourceError::InvalidResponse(format!("{}: {}", operation, e)))
}

/// Check the response and return its raw body
pub async fn bytes(response: Response, operation: &str) -> Result<Vec<u8>> {
    let response = check(response, operation).await?;
    Ok(response.bytes().await?.to_vec())
}
