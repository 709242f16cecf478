//! Storage backend port
//!
//! Workers persist observables through the [`Backend`] trait. One backend
//! connection exists per worker process; consumer threads only ever see it
//! through [`SharedBackend`], which holds the process-wide lock for the
//! duration of each `create` call.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use cif_common::{CifError, Observable, Result};

pub mod jsonl;
pub mod memory;

pub use jsonl::JsonlBackend;
pub use memory::{MemoryBackend, MemoryStore};

/// What a failed `create` may leave behind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateAtomicity {
    /// Either every observable of the call is stored or none is
    AllOrNothing,
    /// Observables are stored one by one; a fault can leave a prefix stored
    PerItem,
}

/// Storage capability consumed by workers.
///
/// `create` must be idempotent per observable identity: deliveries are
/// at-least-once, so the same observable can arrive more than once.
pub trait Backend: Send {
    fn name(&self) -> &str;

    fn atomicity(&self) -> CreateAtomicity;

    fn connect(&mut self, uri: &str) -> Result<()>;

    fn create(&mut self, observables: &[Observable]) -> Result<()>;
}

/// Process-wide backend connection guarded by a single lock
#[derive(Clone)]
pub struct SharedBackend {
    inner: Arc<Mutex<Box<dyn Backend>>>,
    name: String,
    atomicity: CreateAtomicity,
}

impl SharedBackend {
    /// Connect `backend` to `uri` and put it behind the process-wide lock.
    ///
    /// This is the only way to build a `SharedBackend`, so consumers never
    /// see a backend that skipped `connect`.
    pub fn connect(mut backend: Box<dyn Backend>, uri: &str) -> Result<Self> {
        debug!(backend = %backend.name(), uri = %uri, "Connecting to backend");
        backend.connect(uri)?;
        info!(backend = %backend.name(), "Connected to backend");
        Ok(Self::wrap(backend))
    }

    fn wrap(backend: Box<dyn Backend>) -> Self {
        Self {
            name: backend.name().to_string(),
            atomicity: backend.atomicity(),
            inner: Arc::new(Mutex::new(backend)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn atomicity(&self) -> CreateAtomicity {
        self.atomicity
    }

    /// Persist `observables` while holding the process-wide lock.
    ///
    /// A panic inside the backend is caught and reported as an error, so the
    /// lock is released on every path and never poisoned by `create` itself.
    pub fn create(&self, observables: &[Observable]) -> Result<()> {
        let mut backend = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(backend = %self.name, count = observables.len(), "Creating observables");

        match panic::catch_unwind(AssertUnwindSafe(|| backend.create(observables))) {
            Ok(result) => result,
            Err(payload) => Err(CifError::Backend(format!(
                "{} panicked during create: {}",
                self.name,
                panic_message(payload.as_ref())
            ))),
        }
    }
}

impl std::fmt::Debug for SharedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBackend")
            .field("name", &self.name)
            .field("atomicity", &self.atomicity)
            .finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

type BackendFactory = Box<dyn Fn() -> Box<dyn Backend> + Send + Sync>;

/// Backends selectable by name from configuration
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl BackendRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the backends shipped in this crate
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("memory", || Box::new(MemoryBackend::new()));
        registry.register("jsonl", || Box::new(JsonlBackend::new()));
        registry
    }

    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Backend> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_lowercase(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate the named backend and connect it once
    pub fn open(&self, name: &str, uri: &str) -> Result<SharedBackend> {
        let factory = self
            .factories
            .get(&name.to_lowercase())
            .ok_or_else(|| CifError::Config(format!("Unknown storage backend: {}", name)))?;

        SharedBackend::connect(factory(), uri)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use cif_common::ObservableType;

    struct PanickingBackend {
        calls: usize,
    }

    impl Backend for PanickingBackend {
        fn name(&self) -> &str {
            "panicking"
        }

        fn atomicity(&self) -> CreateAtomicity {
            CreateAtomicity::AllOrNothing
        }

        fn connect(&mut self, _uri: &str) -> Result<()> {
            Ok(())
        }

        fn create(&mut self, _observables: &[Observable]) -> Result<()> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("connection reset");
            }
            Ok(())
        }
    }

    #[test]
    fn test_panic_in_create_is_an_error_and_releases_lock() {
        let shared = SharedBackend::connect(Box::new(PanickingBackend { calls: 0 }), "test://").unwrap();
        let batch = vec![Observable::new(ObservableType::Fqdn, "example.com")];

        let err = shared.create(&batch).unwrap_err();
        assert!(err.to_string().contains("connection reset"));

        // A second caller can take the lock and succeed
        shared.create(&batch).unwrap();
    }

    #[test]
    fn test_registry_open_unknown_backend() {
        let registry = BackendRegistry::builtin();
        assert!(registry.contains("MEMORY"));
        assert!(matches!(registry.open("neo4j", "bolt://x"), Err(CifError::Config(_))));
    }

    #[test]
    fn test_registry_open_connects() {
        let registry = BackendRegistry::builtin();
        let shared = registry.open("memory", "memory://").unwrap();
        assert_eq!(shared.name(), "memory");
        assert_eq!(shared.atomicity(), CreateAtomicity::AllOrNothing);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["jsonl", "memory"]);
    }

    #[test]
    fn test_connect_makes_memory_backend_usable() {
        let backend = MemoryBackend::new();
        let store = backend.store();
        let shared = SharedBackend::connect(Box::new(backend), "memory://").unwrap();

        shared
            .create(&[Observable::new(ObservableType::Fqdn, "example.net")])
            .unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_connect_failure_is_returned() {
        let result = SharedBackend::connect(Box::new(JsonlBackend::new()), "");
        assert!(matches!(result, Err(CifError::Backend(_))));
    }
}
