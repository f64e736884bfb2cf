//! Module cache
//!
//! Path-keyed map of loaded modules with hit/miss/eviction counters and
//! least-recently-used trimming. One `RwLock` guards the map; counters are
//! atomics so lookups only need the read lock.

use crate::module::{Module, ModuleState};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that found a module
    pub hits: u64,
    /// Lookups that found nothing
    pub misses: u64,
    /// Modules removed or trimmed
    pub evictions: u64,
    /// Modules currently cached
    pub size: usize,
}

impl CacheStats {
    /// Fraction of lookups that hit, 0.0 with no lookups
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Cache of loaded modules keyed by logical path
#[derive(Default)]
pub struct ModuleCache {
    modules: RwLock<FxHashMap<String, Arc<Module>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ModuleCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a module and mark it accessed
    pub fn put(&self, module: Arc<Module>) {
        module.touch();
        let path = module.path().to_string();
        self.modules.write().insert(path, module);
    }

    /// Insert `module` unless its path is taken
    ///
    /// Returns the module already cached under the path when there is one.
    pub(crate) fn insert_if_absent(&self, module: Arc<Module>) -> Result<(), Arc<Module>> {
        let mut modules = self.modules.write();
        if let Some(existing) = modules.get(module.path()) {
            return Err(Arc::clone(existing));
        }
        module.touch();
        modules.insert(module.path().to_string(), module);
        Ok(())
    }

    /// Look up a module, counting the hit or miss and refreshing its access tick
    pub fn get(&self, path: &str) -> Option<Arc<Module>> {
        let found = self.modules.read().get(path).cloned();
        match &found {
            Some(module) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                module.touch();
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
            }
        }
        found
    }

    /// Look up a module without touching counters or access ticks
    pub fn peek(&self, path: &str) -> Option<Arc<Module>> {
        self.modules.read().get(path).cloned()
    }

    /// Remove a module from the cache
    pub fn remove(&self, path: &str) -> Option<Arc<Module>> {
        let removed = self.modules.write().remove(path);
        if removed.is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every module
    pub fn clear(&self) -> Vec<Arc<Module>> {
        self.modules.write().drain().map(|(_, module)| module).collect()
    }

    /// Visit every cached module
    pub fn iterate<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<Module>),
    {
        for (path, module) in self.modules.read().iter() {
            f(path, module);
        }
    }

    /// Every cached module, ordered by path
    pub fn modules(&self) -> Vec<Arc<Module>> {
        let mut modules: Vec<Arc<Module>> = self.modules.read().values().cloned().collect();
        modules.sort_by(|a, b| a.path().cmp(b.path()));
        modules
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.modules.read().len(),
        }
    }

    /// Fraction of lookups that hit
    pub fn hit_ratio(&self) -> f64 {
        self.stats().hit_ratio()
    }

    /// Evict least recently used modules until at most `max_size` remain
    ///
    /// Pinned modules (`ref_count > 0`) and modules still loading are
    /// skipped. Returns the evicted modules so the caller can release them.
    pub(crate) fn evict_lru(&self, max_size: usize) -> Vec<Arc<Module>> {
        let mut modules = self.modules.write();
        if modules.len() <= max_size {
            return Vec::new();
        }

        let mut candidates: Vec<(String, u64)> = modules
            .iter()
            .map(|(path, module)| (path.clone(), module.last_access()))
            .collect();
        candidates.sort_by_key(|(_, tick)| *tick);

        let mut evicted = Vec::new();
        for (path, _) in candidates {
            if modules.len() <= max_size {
                break;
            }
            let evictable = modules
                .get(&path)
                .map(|m| m.ref_count() == 0 && m.state() != ModuleState::Loading)
                .unwrap_or(false);
            if !evictable {
                continue;
            }
            if let Some(module) = modules.remove(&path) {
                tracing::trace!(target: "swiftlang::cache", module = %path, "evicted");
                evicted.push(module);
            }
        }

        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        evicted
    }

    /// Trim to at most `max_size` modules, returning how many were evicted
    pub fn trim(&self, max_size: usize) -> usize {
        self.evict_lru(max_size).len()
    }

    /// Insert many modules at once, returning how many were added
    pub fn preload<I>(&self, modules: I) -> usize
    where
        I: IntoIterator<Item = Arc<Module>>,
    {
        let mut map = self.modules.write();
        let mut added = 0;
        for module in modules {
            module.touch();
            if map.insert(module.path().to_string(), module).is_none() {
                added += 1;
            }
        }
        added
    }

    /// Number of cached modules
    pub fn len(&self) -> usize {
        self.modules.read().len()
    }

    /// Check whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.modules.read().is_empty()
    }

    /// Check whether `path` is cached
    pub fn contains(&self, path: &str) -> bool {
        self.modules.read().contains_key(path)
    }
}

impl std::fmt::Debug for ModuleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("stats", &self.stats())
            .finish()
    }
}
