//! Algorithm catalog (C1).
//!
//! Grounded on the teacher's `ConcurrentExecutorRegistry`
//! (`enviro-core/src/executor/mod.rs`): an `Arc<RwLock<HashMap<...>>>`
//! guarding a keyed catalog, read far more often than written.

pub mod overrides;
pub mod spec;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::RegistryError;
pub use spec::{
    AlgorithmKind, AlgorithmLifecycle, AlgorithmMetadata, AlgorithmSpec, Entrypoint,
    ExecutionConfig, ExecutionMode, LoggingConfig,
};

type Key = (String, String);

/// Thread-safe catalog of registered algorithms, keyed by `(name, version)`.
#[derive(Clone, Default)]
pub struct AlgorithmRegistry {
    inner: Arc<RwLock<HashMap<Key, AlgorithmSpec>>>,
    /// Override records that arrived (or were loaded) for a `(name,
    /// version)` not yet registered. Applied automatically the moment a
    /// matching spec registers (`spec.md` §4.1: overrides may load before
    /// or after the code that declares the algorithm they target). Since
    /// at most one spec can ever hold a given `(name, version)`
    /// (`AlreadyRegistered` rejects the rest), a pending record whose
    /// `(category, kind)` doesn't match the spec that finally registers
    /// will never match anything else under this key - it's dropped with
    /// a warning rather than kept forever.
    pending_overrides: Arc<RwLock<HashMap<Key, Vec<overrides::OverrideRecord>>>>,
}

impl AlgorithmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `spec`, validating it first (`spec.md` §3: "entrypoint and
    /// both schema models [must be] reconstructible by stable identity").
    /// Re-registering the same `(name, version)` is rejected rather than
    /// silently overwritten. Any override records previously loaded for
    /// this `(name, version)` before it was registered are applied now,
    /// in the order they were received.
    pub fn register(&self, mut spec: AlgorithmSpec) -> Result<(), RegistryError> {
        spec.validate()
            .map_err(|reason| RegistryError::InvalidSpec {
                name: spec.name.clone(),
                version: spec.version.clone(),
                reason,
            })?;

        let key = spec.key();
        let mut guard = self.inner.write().unwrap();
        if guard.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered {
                name: key.0,
                version: key.1,
            });
        }

        if let Some(pending) = self.pending_overrides.write().unwrap().remove(&key) {
            for ov in &pending {
                if !ov.apply_to(&mut spec) {
                    tracing::warn!(
                        name = %spec.name,
                        version = %spec.version,
                        "pending override's (category, kind) scope doesn't match the registering spec, dropping",
                    );
                }
            }
        }

        guard.insert(key, spec);
        Ok(())
    }

    /// Registers every spec in `specs` in order, stopping at the first
    /// failure. Convenience for bulk startup registration (`spec.md`
    /// §4.1) where a service wants to declare its whole catalog in one
    /// call rather than one `register` per algorithm.
    pub fn register_all(
        &self,
        specs: impl IntoIterator<Item = AlgorithmSpec>,
    ) -> Result<(), RegistryError> {
        for spec in specs {
            self.register(spec)?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str, version: &str) -> Result<AlgorithmSpec, RegistryError> {
        self.inner
            .read()
            .unwrap()
            .get(&(name.to_string(), version.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            })
    }

    pub fn list(&self) -> Vec<AlgorithmSpec> {
        let mut specs: Vec<_> = self.inner.read().unwrap().values().cloned().collect();
        specs.sort_by(|a, b| (a.name.as_str(), a.version.as_str()).cmp(&(b.name.as_str(), b.version.as_str())));
        specs
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applies a parsed override record to the spec it targets, merging
    /// `(category, kind)`-keyed fields over the code-declared defaults.
    /// If the target hasn't registered yet, the record is cached and
    /// applied automatically the moment it does (`spec.md` §4.1) rather
    /// than silently dropped.
    pub fn apply_override(&self, ov: &overrides::OverrideRecord) -> Result<(), RegistryError> {
        let key = (ov.name.clone(), ov.version.clone());
        let mut guard = self.inner.write().unwrap();
        match guard.get_mut(&key) {
            Some(spec) => {
                if !ov.apply_to(spec) {
                    tracing::warn!(
                        name = %ov.name,
                        version = %ov.version,
                        "override's (category, kind) scope doesn't match the registered spec, skipping",
                    );
                }
            }
            None => self
                .pending_overrides
                .write()
                .unwrap()
                .entry(key)
                .or_default()
                .push(ov.clone()),
        }
        Ok(())
    }

    /// Loads and applies every `*.algometa.yaml` override file in `dir`
    /// (non-recursive), in lexical filename order so that later files win
    /// ties deterministically.
    pub fn load_overrides(&self, dir: &std::path::Path) -> Result<usize, RegistryError> {
        let records = overrides::load_overrides_from_dir(dir).map_err(|e| RegistryError::InvalidSpec {
            name: "*".into(),
            version: "*".into(),
            reason: e,
        })?;
        let count = records.len();
        for ov in &records {
            self.apply_override(ov)?;
        }
        Ok(count)
    }
}
