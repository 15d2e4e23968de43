// Authorization server transport port

use async_trait::async_trait;
use serde_json::Value;

use super::types::AuthRequest;
use crate::error::TransportFailure;

/// Performs the HTTP exchange with the authorization server
///
/// A success carries the parsed body (`Value::String` for text responses).
/// Network errors and non-2xx statuses surface as `TransportFailure`.
#[async_trait]
pub trait AuthTransport: Send + Sync {
    async fn send(&self, request: AuthRequest) -> Result<Value, TransportFailure>;
}
