// Token lifecycle events and observers

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use tokio::sync::mpsc;

use super::types::{token_preview, TokenState};

/// Events emitted by the token manager
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    /// access() completed, including the already-authenticated short-circuit
    Success(TokenState),
    /// auth_check() found a valid token
    Access(TokenState),
    /// access()/revoke() failed, or a header was requested while unauthenticated
    Error(Value),
    /// refresh() completed
    Refresh(TokenState),
    /// refresh() failed
    Failure(Value),
    /// revoke() completed; `None` for a local-only clear
    Revoke(Option<Value>),
    /// Authenticated flag was recomputed
    Auth(bool),
}

impl AuthEvent {
    /// Event name
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::Success(_) => "success",
            AuthEvent::Access(_) => "access",
            AuthEvent::Error(_) => "error",
            AuthEvent::Refresh(_) => "refresh",
            AuthEvent::Failure(_) => "failure",
            AuthEvent::Revoke(_) => "revoke",
            AuthEvent::Auth(_) => "auth",
        }
    }

    /// Event payload as JSON
    pub fn payload(&self) -> Value {
        match self {
            AuthEvent::Success(state) | AuthEvent::Access(state) | AuthEvent::Refresh(state) => {
                serde_json::to_value(state).unwrap_or(Value::Null)
            }
            AuthEvent::Error(payload) | AuthEvent::Failure(payload) => payload.clone(),
            AuthEvent::Revoke(payload) => payload.clone().unwrap_or(Value::Null),
            AuthEvent::Auth(flag) => Value::Bool(*flag),
        }
    }
}

/// Receives named events with their payload
pub trait AuthListener: Send + Sync {
    fn on_event(&self, event: &AuthEvent);
}

impl AuthListener for mpsc::UnboundedSender<AuthEvent> {
    fn on_event(&self, event: &AuthEvent) {
        // Closed receivers simply stop listening
        let _ = self.send(event.clone());
    }
}

/// Logs every event through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingListener;

impl AuthListener for TracingListener {
    fn on_event(&self, event: &AuthEvent) {
        match event {
            AuthEvent::Success(state) | AuthEvent::Refresh(state) => {
                tracing::info!(
                    event = event.name(),
                    token = %state.access_token.as_deref().map(token_preview).unwrap_or_default(),
                    expires_in_ms = ?state.expires_in,
                    "Token acquired"
                );
            }
            AuthEvent::Access(_) => tracing::debug!(event = event.name(), "Token is valid"),
            AuthEvent::Error(payload) | AuthEvent::Failure(payload) => {
                tracing::warn!(event = event.name(), payload = %payload, "Token operation failed");
            }
            AuthEvent::Revoke(_) => tracing::info!(event = event.name(), "Token revoked"),
            AuthEvent::Auth(flag) => {
                tracing::debug!(event = event.name(), authenticated = flag, "Authentication status recomputed");
            }
        }
    }
}

/// Publish/subscribe fan-out of auth events
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn AuthListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for all subsequent events
    pub fn subscribe(&self, listener: Arc<dyn AuthListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Register an unbounded channel and return its receiving end
    pub fn channel(&self) -> mpsc::UnboundedReceiver<AuthEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(tx));
        rx
    }

    pub fn emit(&self, event: AuthEvent) {
        // Snapshot so listeners may subscribe from inside a callback
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            listener.on_event(&event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
