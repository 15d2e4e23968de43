// Error handling module
// Defines the token lifecycle error taxonomy and event payload conversion

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Failed exchange with the authorization server
///
/// Produced by transports for network errors and non-2xx responses alike.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{message}")]
pub struct TransportFailure {
    /// HTTP status, absent for network-level failures
    pub status: Option<u16>,
    pub message: String,
    /// Response body, parsed as JSON when possible
    pub body: Value,
}

impl TransportFailure {
    pub fn new(status: Option<u16>, message: impl Into<String>, body: Value) -> Self {
        Self {
            status,
            message: message.into(),
            body,
        }
    }

    /// Raw payload delivered with `error`/`failure` events
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Token lifecycle errors
#[derive(Error, Debug)]
pub enum TokenError {
    /// No valid token to build an authorization header from
    #[error("Unauthorized, please use access() to authenticate first")]
    Unauthorized,

    /// refresh() called with no refresh token on record
    #[error("No authentication data found, please use the access method first")]
    NoRefreshToken,

    /// Authorization server exchange failed
    #[error("Authorization server request failed: {0}")]
    Transport(TransportFailure),

    /// Authorization server answered with an unusable payload
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),

    /// A newer exchange (or a clear) was issued while this one was in flight
    #[error("Token exchange superseded by a newer request")]
    Superseded,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TokenError {
    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            TokenError::Unauthorized => "unauthorized",
            TokenError::NoRefreshToken => "no_refresh_token",
            TokenError::Transport(_) => "transport_failure",
            TokenError::InvalidResponse(_) => "invalid_response",
            TokenError::Superseded => "superseded",
            TokenError::Config(_) => "config_error",
        }
    }

    /// Payload for `error`/`failure` events
    pub fn to_payload(&self) -> Value {
        match self {
            TokenError::Transport(failure) => failure.to_payload(),
            other => json!({
                "error": other.kind(),
                "message": other.to_string(),
            }),
        }
    }
}

impl From<TransportFailure> for TokenError {
    fn from(failure: TransportFailure) -> Self {
        TokenError::Transport(failure)
    }
}

/// Result type alias for token operations
pub type Result<T> = std::result::Result<T, TokenError>;
