use reqwest::StatusCode;

use crate::credentials::AuthError;
use crate::transport::TransportError;

/// Errors surfaced by connector construction and conversation operations.
///
/// Nothing here is retried internally; transport failures are logged with
/// their request context by the transport layer and propagate unchanged so
/// callers can apply their own policy.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("invalid service url `{0}`")]
    InvalidServiceUrl(String),
    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("service responded with {status}: {message}")]
    Service { status: StatusCode, message: String },
    #[error("invalid service response: {0}")]
    InvalidResponse(String),
}
