//! Runtime context shared by a loader and its children
//!
//! Holds the lifecycle hook registry and module metrics. A loader receives
//! its context at construction; children inherit the parent's.

mod hooks;
mod metrics;

pub use hooks::{
    ErrorHook, GlobalHooks, HookFilter, HookId, HookRegistry, HookStats, InitHook, LifecycleHook,
    ModuleHooks,
};
pub use metrics::{MetricsRegistry, ModuleMetrics};

/// Hooks and metrics for a family of loaders
#[derive(Debug, Default)]
pub struct RuntimeContext {
    hooks: HookRegistry,
    metrics: MetricsRegistry,
}

impl RuntimeContext {
    /// Fresh context with no hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Lifecycle hooks
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Module metrics
    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }
}
