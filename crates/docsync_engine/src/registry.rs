//! Engine registry.

use crate::error::SyncResult;
use crate::synchronizer::Synchronizer;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Live engines keyed by instance key.
///
/// Hosts own the registry and pass it where engines are needed. At most one
/// engine exists per key: lookups and creation happen under one lock.
#[derive(Debug, Default)]
pub struct SynchronizerRegistry {
    engines: Mutex<HashMap<String, Synchronizer>>,
}

impl SynchronizerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the engine for `key`, creating it with `init` if there is none.
    ///
    /// `init` runs under the registry lock and must not touch the registry.
    pub fn get_or_create(
        &self,
        key: &str,
        init: impl FnOnce() -> SyncResult<Synchronizer>,
    ) -> SyncResult<Synchronizer> {
        let mut engines = self.engines.lock();
        if let Some(engine) = engines.get(key) {
            return Ok(engine.clone());
        }
        let engine = init()?;
        tracing::debug!(key, "registered sync engine");
        engines.insert(key.to_string(), engine.clone());
        Ok(engine)
    }

    /// Returns the engine for `key`.
    pub fn get(&self, key: &str) -> Option<Synchronizer> {
        self.engines.lock().get(key).cloned()
    }

    /// Removes and stops the engine for `key`.
    pub fn remove(&self, key: &str) -> Option<Synchronizer> {
        let engine = self.engines.lock().remove(key)?;
        engine.stop();
        Some(engine)
    }

    /// Number of registered engines.
    pub fn len(&self) -> usize {
        self.engines.lock().len()
    }

    /// Returns true if no engine is registered.
    pub fn is_empty(&self) -> bool {
        self.engines.lock().is_empty()
    }
}
