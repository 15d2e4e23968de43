// In-memory credential store

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use super::CredentialStore;

/// Process-local store used when no durable storage is available
///
/// Values are lost when the process exits.
#[derive(Debug)]
pub struct EphemeralStore {
    values: Mutex<HashMap<String, String>>,
}

impl EphemeralStore {
    pub fn new() -> Self {
        tracing::warn!("Durable credential storage not available: tokens are kept in memory only");
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for EphemeralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialStore for EphemeralStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        tracing::debug!("Storing {} in memory only", key);
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.remove(key);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
