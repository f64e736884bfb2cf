//! Per-module load metrics

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::time::Duration;

/// Counters and timings for one module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModuleMetrics {
    /// Time spent resolving, decoding and executing the body
    pub load_time: Duration,
    /// Time spent in deferred initialization
    pub init_time: Duration,
    /// Times the module was handed out
    pub access_count: u64,
    /// Export lookups through the loader
    pub export_lookups: u64,
    /// Loads served from the cache
    pub cache_hits: u64,
    /// Loads that went to disk
    pub cache_misses: u64,
}

/// Metrics for every module a loader touched
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    modules: RwLock<FxHashMap<String, ModuleMetrics>>,
}

impl MetricsRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, path: &str, f: impl FnOnce(&mut ModuleMetrics)) {
        let mut modules = self.modules.write();
        match modules.get_mut(path) {
            Some(metrics) => f(metrics),
            None => {
                let mut metrics = ModuleMetrics::default();
                f(&mut metrics);
                modules.insert(path.to_string(), metrics);
            }
        }
    }

    /// Record a completed load
    pub fn record_load(&self, path: &str, elapsed: Duration) {
        self.update(path, |m| {
            m.load_time = elapsed;
            m.cache_misses += 1;
            m.access_count += 1;
        });
    }

    /// Record a deferred initialization
    pub fn record_init(&self, path: &str, elapsed: Duration) {
        self.update(path, |m| m.init_time = elapsed);
    }

    /// Record a load served from the cache
    pub fn record_cache_hit(&self, path: &str) {
        self.update(path, |m| {
            m.cache_hits += 1;
            m.access_count += 1;
        });
    }

    /// Record an export lookup
    pub fn record_export_lookup(&self, path: &str) {
        self.update(path, |m| m.export_lookups += 1);
    }

    /// Metrics for one module
    pub fn get(&self, path: &str) -> Option<ModuleMetrics> {
        self.modules.read().get(path).copied()
    }

    /// Every module's metrics, ordered by path
    pub fn snapshot(&self) -> Vec<(String, ModuleMetrics)> {
        let mut all: Vec<_> = self
            .modules
            .read()
            .iter()
            .map(|(path, metrics)| (path.clone(), *metrics))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Forget everything
    pub fn reset(&self) {
        self.modules.write().clear();
    }
}
