//! Upstream HTTP client
//!
//! Issues the chat-completions POST and maps failure statuses onto the
//! gateway error taxonomy before any byte reaches the translator.

use crate::resolver::UpstreamTarget;
use gantry_core::openai::ChatCompletionRequest;
use gantry_core::GatewayError;
use std::time::Duration;
use tracing::error;

/// Build the shared upstream client. Connects are bounded; reads are not,
/// because streams legitimately idle between tokens (the dispatcher's ping
/// ticker covers the client side).
pub fn build_client() -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| GatewayError::ConnectionError(e.to_string()))
}

/// POST a chat-completions payload; returns the streaming response.
pub async fn post_chat(
    client: &reqwest::Client,
    target: &UpstreamTarget,
    payload: &ChatCompletionRequest,
) -> Result<reqwest::Response, GatewayError> {
    let response = client
        .post(target.url())
        .header("Authorization", format!("Bearer {}", target.bearer_token))
        .header("Content-Type", "application/json")
        .json(payload)
        .send()
        .await
        .map_err(map_send_error)?;

    check_status(response).await
}

/// POST an Anthropic-format body unchanged (passthrough handler).
pub async fn post_passthrough(
    client: &reqwest::Client,
    target: &UpstreamTarget,
    body: &serde_json::Value,
) -> Result<reqwest::Response, GatewayError> {
    let response = client
        .post(target.url())
        .header("x-api-key", &target.bearer_token)
        .header("anthropic-version", "2023-06-01")
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(map_send_error)?;

    check_status(response).await
}

fn map_send_error(e: reqwest::Error) -> GatewayError {
    if e.is_connect() || e.is_timeout() {
        GatewayError::ConnectionError(e.to_string())
    } else {
        GatewayError::UpstreamError(e.to_string())
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    error!("upstream returned {}: {}", status, body);

    Err(map_status(status.as_u16(), &body, retry_after))
}

/// Status -> error-kind mapping for upstream responses.
pub fn map_status(status: u16, body: &str, retry_after: Option<u64>) -> GatewayError {
    let lower = body.to_lowercase();
    match status {
        401 | 403 => GatewayError::AuthError(body.to_string()),
        404 if lower.contains("model") => GatewayError::ModelNotFound(body.to_string()),
        400 if lower.contains("tool") || lower.contains("not supported") => {
            GatewayError::CapabilityError(body.to_string())
        }
        429 => GatewayError::RateLimited { message: body.to_string(), retry_after },
        _ => GatewayError::UpstreamError(format!("{}: {}", status, body)),
    }
}
