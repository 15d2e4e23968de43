// Credential persistence
// Key-value stores backing the token manager

mod ephemeral;
mod sqlite;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

pub use ephemeral::EphemeralStore;
pub use sqlite::SqliteStore;

/// Durable key-value persistence
///
/// A missing key is `Ok(None)`, never an error. Errors mean the backing
/// storage itself is unavailable.
pub trait CredentialStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Whether values survive a process restart
    fn is_durable(&self) -> bool {
        true
    }
}

/// Open the SQLite store at `path`, degrading to an ephemeral store
///
/// `None` selects the ephemeral store directly.
pub fn open_store(path: Option<&Path>) -> Arc<dyn CredentialStore> {
    let Some(path) = path else {
        return Arc::new(EphemeralStore::new());
    };

    match SqliteStore::open(path) {
        Ok(store) => {
            tracing::info!("Using credential store: {}", store.path().display());
            Arc::new(store)
        }
        Err(e) => {
            tracing::warn!("Credential store unavailable ({:#}), falling back to memory", e);
            Arc::new(EphemeralStore::new())
        }
    }
}
