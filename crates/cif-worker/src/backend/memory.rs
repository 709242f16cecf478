//! In-process backend keyed by observable identity

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use cif_common::{CifError, Observable, ObservableType, Result};

use super::{Backend, CreateAtomicity};

type Identity = (ObservableType, String);

/// Handle onto the observables a [`MemoryBackend`] holds
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    observables: Arc<Mutex<BTreeMap<Identity, Observable>>>,
}

impl MemoryStore {
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, otype: ObservableType, value: &str) -> Option<Observable> {
        self.lock().get(&(otype, value.to_string())).cloned()
    }

    pub fn all(&self) -> Vec<Observable> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Identity, Observable>> {
        self.observables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Upserts by identity, so redelivered messages overwrite rather than duplicate
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: MemoryStore,
    connected: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(store: MemoryStore) -> Self {
        Self {
            store,
            connected: false,
        }
    }

    pub fn store(&self) -> MemoryStore {
        self.store.clone()
    }
}

impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn atomicity(&self) -> CreateAtomicity {
        CreateAtomicity::AllOrNothing
    }

    fn connect(&mut self, _uri: &str) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    fn create(&mut self, observables: &[Observable]) -> Result<()> {
        if !self.connected {
            return Err(CifError::Backend("memory backend is not connected".to_string()));
        }

        let mut map = self.store.lock();
        for observable in observables {
            let (otype, value) = observable.identity();
            map.insert((otype, value.to_string()), observable.clone());
        }
        Ok(())
    }
}
