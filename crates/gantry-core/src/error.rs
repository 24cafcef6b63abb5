//! Gateway error taxonomy
//!
//! One variant per failure kind the gateway can surface. Each kind knows its
//! HTTP status and the `type` string used in Anthropic-style error bodies.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("upstream rejected credentials: {0}")]
    AuthError(String),

    #[error("unknown model: {0}")]
    ModelNotFound(String),

    #[error("capability not supported by upstream: {0}")]
    CapabilityError(String),

    #[error("upstream rate limited: {message}")]
    RateLimited {
        message: String,
        /// Seconds from the upstream Retry-After header, when present
        retry_after: Option<u64>,
    },

    #[error("upstream error: {0}")]
    UpstreamError(String),

    #[error("failed to reach upstream: {0}")]
    ConnectionError(String),

    #[error("translator invariant violated: {0}")]
    TranslatorError(String),
}

impl GatewayError {
    /// HTTP status for error responses sent before any SSE byte.
    pub fn status(&self) -> u16 {
        match self {
            GatewayError::InvalidRequest(_) => 400,
            GatewayError::AuthError(_) => 401,
            GatewayError::ModelNotFound(_) => 404,
            GatewayError::CapabilityError(_) => 400,
            GatewayError::RateLimited { .. } => 429,
            GatewayError::UpstreamError(_) => 502,
            GatewayError::ConnectionError(_) => 503,
            GatewayError::TranslatorError(_) => 500,
        }
    }

    /// The `error.type` string in Anthropic-style error bodies.
    pub fn wire_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::AuthError(_) => "auth_error",
            GatewayError::ModelNotFound(_) => "model_not_found",
            GatewayError::CapabilityError(_) => "capability_error",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::UpstreamError(_) => "upstream_error",
            GatewayError::ConnectionError(_) => "connection_error",
            GatewayError::TranslatorError(_) => "translator_error",
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::InvalidRequest(err.to_string())
    }
}
