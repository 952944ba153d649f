// Gateway error kinds shared across dispatch, executors and translation.

use axum::http::StatusCode;
use thiserror::Error;

use crate::translator::Dialect;

/// Error type for everything that can go wrong between accepting a client
/// request and returning (or streaming) a response.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Credential lacks required key material. The credential gets disabled.
    #[error("unauthenticated credential: {0}")]
    Unauthenticated(String),

    /// Upstream answered with a non-2xx status. The body is passed through
    /// to the client verbatim; `retry_after` is parsed from the response
    /// headers when present.
    #[error("upstream status {status}")]
    UpstreamStatus {
        status: u16,
        body: Vec<u8>,
        content_type: String,
        retry_after: Option<u64>,
    },

    #[error("network error: {0}")]
    Network(String),

    /// Malformed upstream payload the converter cannot parse mid-stream.
    #[error("translation error: {0}")]
    Translation(String),

    #[error("request cancelled by client")]
    ClientCancelled,

    #[error("no eligible credential for dialect {dialect} model {model}")]
    NoEligibleCredential { dialect: Dialect, model: String },

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    pub fn upstream(status: u16, body: Vec<u8>, content_type: &str, retry_after: Option<u64>) -> Self {
        GatewayError::UpstreamStatus {
            status,
            body,
            content_type: content_type.to_string(),
            retry_after,
        }
    }

    /// Whether the selector may move on to another credential after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::UpstreamStatus { status, .. } => {
                matches!(status, 401 | 403 | 429) || *status >= 500
            }
            GatewayError::Network(_) => true,
            _ => false,
        }
    }

    /// HTTP status surfaced to the client when this error ends the dispatch.
    pub fn client_status(&self) -> StatusCode {
        match self {
            GatewayError::ConfigInvalid(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::UpstreamStatus { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Network(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Translation(_) => StatusCode::BAD_GATEWAY,
            GatewayError::ClientCancelled => StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_GATEWAY),
            GatewayError::NoEligibleCredential { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Network(format!("timeout: {err}"))
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
