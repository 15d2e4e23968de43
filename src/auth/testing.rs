// Scripted transport for unit tests

use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::transport::AuthTransport;
use super::types::AuthRequest;
use crate::error::TransportFailure;

/// Replays queued responses and records every request
#[derive(Default)]
pub struct MockTransport {
    responses: Mutex<VecDeque<Result<Value, TransportFailure>>>,
    requests: Mutex<Vec<AuthRequest>>,
    gate: Option<Arc<Notify>>,
    /// Per-request gates, consumed in request order
    gates: Mutex<VecDeque<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Each request waits for a `notify_one` on `gate` before answering
    pub fn gated(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some(gate),
            ..Self::default()
        })
    }

    /// The n-th request waits on the n-th gate, so answers can be reordered
    pub fn with_gates(gates: Vec<Arc<Notify>>) -> Arc<Self> {
        Arc::new(Self {
            gates: Mutex::new(gates.into()),
            ..Self::default()
        })
    }

    pub fn respond(&self, response: Result<Value, TransportFailure>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn requests(&self) -> Vec<AuthRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl AuthTransport for MockTransport {
    async fn send(&self, request: AuthRequest) -> Result<Value, TransportFailure> {
        self.requests.lock().unwrap().push(request);

        let gate = self
            .gates
            .lock()
            .unwrap()
            .pop_front()
            .or_else(|| self.gate.clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportFailure::new(Some(503), "no scripted response", Value::Null)))
    }
}
