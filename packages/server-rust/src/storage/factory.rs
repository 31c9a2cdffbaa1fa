//! Selects and opens the idempotency store backend.

#[cfg(feature = "redb")]
use std::path::PathBuf;
use std::sync::Arc;

use outcome_core::IdempotencyStore;

use super::memory::InMemoryIdempotencyStore;
use super::ExpiringStore;

/// Which backend holds command state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StoreBackend {
    /// No store: every command executes, nothing is replayed.
    Disabled,
    #[default]
    Memory,
    /// redb file at the given path.
    #[cfg(feature = "redb")]
    Redb(PathBuf),
}

impl StoreBackend {
    /// Short name for logs and the health report.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            StoreBackend::Disabled => "disabled",
            StoreBackend::Memory => "memory",
            #[cfg(feature = "redb")]
            StoreBackend::Redb(_) => "redb",
        }
    }
}

/// An opened store, viewed both as the interceptor's contract and as the
/// sweeper's/health check's expiring store.
#[derive(Clone)]
pub struct StoreHandle {
    pub commands: Arc<dyn IdempotencyStore>,
    pub expiring: Arc<dyn ExpiringStore>,
    /// [`StoreBackend::name`] of the backend this came from.
    pub backend: &'static str,
}

impl StoreHandle {
    #[must_use]
    pub fn new<S: ExpiringStore + 'static>(backend: &'static str, store: Arc<S>) -> Self {
        Self {
            commands: store.clone(),
            expiring: store,
            backend,
        }
    }
}

/// Open the configured backend. `Ok(None)` when the store is disabled.
///
/// # Errors
///
/// Returns an error if the redb file cannot be opened.
pub fn open_store(backend: &StoreBackend) -> anyhow::Result<Option<StoreHandle>> {
    let handle = match backend {
        StoreBackend::Disabled => return Ok(None),
        StoreBackend::Memory => {
            StoreHandle::new(backend.name(), Arc::new(InMemoryIdempotencyStore::new()))
        }
        #[cfg(feature = "redb")]
        StoreBackend::Redb(path) => {
            let store = super::redb::RedbIdempotencyStore::open(path)?;
            StoreHandle::new(backend.name(), Arc::new(store))
        }
    };
    tracing::info!(backend = backend.name(), "idempotency store opened");
    Ok(Some(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_is_default() {
        assert_eq!(StoreBackend::default(), StoreBackend::Memory);
        let handle = open_store(&StoreBackend::Memory).unwrap().unwrap();
        assert_eq!(handle.expiring.command_count().await.unwrap(), 0);
        assert_eq!(handle.backend, "memory");
    }

    #[test]
    fn disabled_backend_opens_nothing() {
        assert!(open_store(&StoreBackend::Disabled).unwrap().is_none());
    }

    #[cfg(feature = "redb")]
    #[tokio::test]
    async fn redb_backend_opens_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.redb");
        let handle = open_store(&StoreBackend::Redb(path.clone())).unwrap().unwrap();
        assert_eq!(handle.expiring.command_count().await.unwrap(), 0);
        assert!(path.exists());
    }
}
