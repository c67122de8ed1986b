//! Compiled-graph cache.
//!
//! One [`GraphCache`] per graph level, keyed by definition version id.
//! Versions are immutable, so an entry only goes stale when the engine
//! explicitly invalidates it after a save or activation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use flowdeck_core::error::{FlowError, Result};
use flowdeck_core::types::DefinitionVersion;

use crate::graph::{compile, CompiledGraph, NodeKind};

pub struct GraphCache<K> {
    entries: RwLock<HashMap<String, Arc<CompiledGraph<K>>>>,
}

impl<K: NodeKind> GraphCache<K> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, version_id: &str) -> Option<Arc<CompiledGraph<K>>> {
        let guard = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        guard.get(version_id).cloned()
    }

    /// Return the cached graph for `version`, compiling it on first use.
    ///
    /// Compile failures are not cached.
    pub fn get_or_compile(&self, version: &DefinitionVersion) -> Result<Arc<CompiledGraph<K>>> {
        if let Some(hit) = self.get(&version.id) {
            return Ok(hit);
        }

        let compiled = compile::<K>(&version.graph).map_err(|errors| FlowError::InvalidGraph {
            version_id: version.id.clone(),
            errors: errors.to_string(),
        })?;
        debug!(version_id = %version.id, nodes = compiled.len(), "Graph compiled");

        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        Ok(guard
            .entry(version.id.clone())
            .or_insert_with(|| Arc::new(compiled))
            .clone())
    }

    /// Drop one version. Returns whether it was cached.
    pub fn invalidate(&self, version_id: &str) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        guard.remove(version_id).is_some()
    }

    pub fn clear(&self) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        guard.clear();
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: NodeKind> Default for GraphCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> std::fmt::Debug for GraphCache<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .entries
            .read()
            .map(|guard| guard.len())
            .unwrap_or_default();
        f.debug_struct("GraphCache").field("count", &count).finish()
    }
}
