//! Module lifecycle hooks
//!
//! Per-module hooks fire for one module path; global hooks fire for every
//! module their filter accepts, ordered by ascending priority (registration
//! order among equal priorities). Init runs `before_init` globals, then the
//! module's `on_init`, then `after_init` globals, stopping at the first
//! hook that returns `false`.

use crate::host::ExecutionContext;
use crate::module::Module;
use crate::value::Value;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Hook that can veto initialization
pub type InitHook = Arc<dyn Fn(&Module, &mut dyn ExecutionContext) -> bool + Send + Sync>;

/// Notification hook
pub type LifecycleHook = Arc<dyn Fn(&Module, &mut dyn ExecutionContext) + Send + Sync>;

/// Hook told why a load failed
pub type ErrorHook = Arc<dyn Fn(&Module, &str) + Send + Sync>;

/// Decides whether a global hook applies to a module path
pub type HookFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Identifier returned by [`HookRegistry::register_global`]
pub type HookId = u64;

/// Hooks bound to one module path
#[derive(Clone, Default)]
pub struct ModuleHooks {
    /// After the body ran; `false` fails the load
    pub on_init: Option<InitHook>,
    /// When a lazy module is first initialized
    pub on_first_use: Option<LifecycleHook>,
    /// Before a loaded module is unloaded
    pub on_unload: Option<LifecycleHook>,
    /// When loading fails
    pub on_error: Option<ErrorHook>,
}

impl ModuleHooks {
    /// No hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the init hook
    pub fn on_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.on_init = Some(Arc::new(hook));
        self
    }

    /// Set the first-use hook
    pub fn on_first_use<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) + Send + Sync + 'static,
    {
        self.on_first_use = Some(Arc::new(hook));
        self
    }

    /// Set the unload hook
    pub fn on_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) + Send + Sync + 'static,
    {
        self.on_unload = Some(Arc::new(hook));
        self
    }

    /// Set the error hook
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

/// Hooks applied to every module accepted by `filter`
#[derive(Clone, Default)]
pub struct GlobalHooks {
    /// Before the module's own init hook
    pub before_init: Option<InitHook>,
    /// After the module's own init hook
    pub after_init: Option<InitHook>,
    /// Before the module's own unload hook
    pub before_unload: Option<LifecycleHook>,
    /// After the module's own unload hook
    pub after_unload: Option<LifecycleHook>,
    /// Restricts which modules the hooks see; `None` means all
    pub filter: Option<HookFilter>,
}

impl GlobalHooks {
    /// No hooks
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the before-init hook
    pub fn before_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.before_init = Some(Arc::new(hook));
        self
    }

    /// Set the after-init hook
    pub fn after_init<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) -> bool + Send + Sync + 'static,
    {
        self.after_init = Some(Arc::new(hook));
        self
    }

    /// Set the before-unload hook
    pub fn before_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) + Send + Sync + 'static,
    {
        self.before_unload = Some(Arc::new(hook));
        self
    }

    /// Set the after-unload hook
    pub fn after_unload<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Module, &mut dyn ExecutionContext) + Send + Sync + 'static,
    {
        self.after_unload = Some(Arc::new(hook));
        self
    }

    /// Only apply to modules whose path passes `filter`
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    fn applies_to(&self, path: &str) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(path))
    }
}

/// Hook counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HookStats {
    /// Registered module and global hook sets
    pub total_hooks: usize,
    /// Hook phases run
    pub executions: u64,
    /// Init phases that failed
    pub failures: u64,
}

struct GlobalEntry {
    id: HookId,
    priority: i32,
    hooks: GlobalHooks,
}

#[derive(Default)]
struct HookTable {
    modules: FxHashMap<String, ModuleHooks>,
    globals: Vec<GlobalEntry>,
    next_id: HookId,
}

/// Registry of lifecycle hooks
///
/// Hooks are cloned out of the table before they run, so a hook may load
/// modules or register further hooks.
#[derive(Default)]
pub struct HookRegistry {
    table: RwLock<HookTable>,
    executions: AtomicU64,
    failures: AtomicU64,
}

impl HookRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind hooks to a module path, replacing any already bound
    pub fn set_module_hooks(&self, path: &str, hooks: ModuleHooks) {
        self.table.write().modules.insert(path.to_string(), hooks);
    }

    /// Hooks bound to a module path
    pub fn module_hooks(&self, path: &str) -> Option<ModuleHooks> {
        self.table.read().modules.get(path).cloned()
    }

    /// Unbind a module's hooks
    pub fn remove_module_hooks(&self, path: &str) -> bool {
        self.table.write().modules.remove(path).is_some()
    }

    /// Call the exported function `function` as the module's init hook
    ///
    /// The function must exist, be callable and return a boolean; a nil
    /// result or a call error fails initialization.
    pub fn set_script_init_hook(&self, path: &str, function: &str) {
        let function = function.to_string();
        let hooks = self.module_hooks(path).unwrap_or_default();
        self.set_module_hooks(
            path,
            hooks.on_init(move |module, ctx| run_script_init(module, ctx, &function)),
        );
    }

    /// Call the exported function `function` before the module is unloaded
    pub fn set_script_unload_hook(&self, path: &str, function: &str) {
        let function = function.to_string();
        let hooks = self.module_hooks(path).unwrap_or_default();
        self.set_module_hooks(
            path,
            hooks.on_unload(move |module, ctx| {
                let Some(callee) = module.get_export(&function).filter(Value::is_callable) else {
                    tracing::warn!(target: "swiftlang::hooks", module = %module.path(), function = %function, "unload hook function not found");
                    return;
                };
                if let Err(err) = ctx.call(&callee, &[]) {
                    tracing::warn!(target: "swiftlang::hooks", module = %module.path(), function = %function, error = %err, "unload hook failed");
                }
            }),
        );
    }

    /// Register hooks for every module; lower priorities run first
    pub fn register_global(&self, hooks: GlobalHooks, priority: i32) -> HookId {
        let mut table = self.table.write();
        table.next_id += 1;
        let id = table.next_id;
        let at = table.globals.partition_point(|entry| entry.priority <= priority);
        table.globals.insert(at, GlobalEntry { id, priority, hooks });
        id
    }

    /// Remove a global registration
    pub fn unregister_global(&self, id: HookId) -> bool {
        let mut table = self.table.write();
        let before = table.globals.len();
        table.globals.retain(|entry| entry.id != id);
        table.globals.len() != before
    }

    fn snapshot(&self, path: &str) -> (Option<ModuleHooks>, Vec<GlobalHooks>) {
        let table = self.table.read();
        let globals = table
            .globals
            .iter()
            .filter(|entry| entry.hooks.applies_to(path))
            .map(|entry| entry.hooks.clone())
            .collect();
        (table.modules.get(path).cloned(), globals)
    }

    /// Run init hooks, returning whether all of them accepted the module
    pub fn run_init(&self, module: &Module, ctx: &mut dyn ExecutionContext) -> bool {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let (own, globals) = self.snapshot(module.path());

        let ok = globals
            .iter()
            .filter_map(|g| g.before_init.as_ref())
            .all(|hook| hook(module, &mut *ctx))
            && own
                .as_ref()
                .and_then(|h| h.on_init.as_ref())
                .map_or(true, |hook| hook(module, &mut *ctx))
            && globals
                .iter()
                .filter_map(|g| g.after_init.as_ref())
                .all(|hook| hook(module, &mut *ctx));

        if !ok {
            self.failures.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: "swiftlang::hooks", module = %module.path(), "init hook rejected module");
        }
        ok
    }

    /// Run the module's first-use hook
    pub fn run_first_use(&self, module: &Module, ctx: &mut dyn ExecutionContext) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = self.module_hooks(module.path()).and_then(|h| h.on_first_use) {
            hook(module, ctx);
        }
    }

    /// Run unload hooks
    pub fn run_unload(&self, module: &Module, ctx: &mut dyn ExecutionContext) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let (own, globals) = self.snapshot(module.path());

        for hook in globals.iter().filter_map(|g| g.before_unload.as_ref()) {
            hook(module, &mut *ctx);
        }
        if let Some(hook) = own.as_ref().and_then(|h| h.on_unload.as_ref()) {
            hook(module, &mut *ctx);
        }
        for hook in globals.iter().filter_map(|g| g.after_unload.as_ref()) {
            hook(module, &mut *ctx);
        }
    }

    /// Run the module's error hook
    pub fn run_error(&self, module: &Module, message: &str) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        if let Some(hook) = self.module_hooks(module.path()).and_then(|h| h.on_error) {
            hook(module, message);
        }
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> HookStats {
        let table = self.table.read();
        HookStats {
            total_hooks: table.modules.len() + table.globals.len(),
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_script_init(module: &Module, ctx: &mut dyn ExecutionContext, function: &str) -> bool {
    let Some(callee) = module.get_export(function).filter(Value::is_callable) else {
        tracing::warn!(target: "swiftlang::hooks", module = %module.path(), function, "init hook function not found");
        return false;
    };
    match ctx.call(&callee, &[]) {
        Ok(Value::Bool(accepted)) => accepted,
        Ok(Value::Nil) => {
            tracing::warn!(target: "swiftlang::hooks", module = %module.path(), function, "init hook returned nil");
            false
        }
        Ok(other) => {
            tracing::warn!(target: "swiftlang::hooks", module = %module.path(), function, returned = other.type_name(), "init hook must return bool");
            false
        }
        Err(err) => {
            tracing::warn!(target: "swiftlang::hooks", module = %module.path(), function, error = %err, "init hook failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::DetachedContext;
    use crate::module::ModuleKind;
    use crate::value::NativeFunction;
    use parking_lot::Mutex;

    fn module(path: &str) -> Module {
        Module::new(path, format!("/m/{}.swift", path), ModuleKind::Source)
    }

    struct CallingContext;

    impl ExecutionContext for CallingContext {
        fn define_global(&mut self, _name: &str, _value: Value) {}

        fn run(
            &mut self,
            _chunk: &swiftlang_bytecode::Chunk,
            _scope: &crate::host::ExecScope<'_>,
        ) -> Result<(), String> {
            Ok(())
        }

        fn globals(&self) -> Vec<(Arc<str>, Value)> {
            Vec::new()
        }

        fn call(&mut self, callee: &Value, args: &[Value]) -> Result<Value, String> {
            match callee {
                Value::Native(f) => f.call(args),
                _ => Err("not callable".to_string()),
            }
        }
    }

    #[test]
    fn test_global_priority_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (label, priority) in [("b", 5), ("a", 1), ("c", 5), ("first", -3)] {
            let order = Arc::clone(&order);
            registry.register_global(
                GlobalHooks::new().before_init(move |_, _| {
                    order.lock().push(label);
                    true
                }),
                priority,
            );
        }

        assert!(registry.run_init(&module("m"), &mut DetachedContext::default()));
        assert_eq!(*order.lock(), vec!["first", "a", "b", "c"]);
    }

    #[test]
    fn test_init_stops_at_first_failure() {
        let registry = HookRegistry::new();
        let after_ran = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&after_ran);

        registry.set_module_hooks("m", ModuleHooks::new().on_init(|_, _| false));
        registry.register_global(
            GlobalHooks::new().after_init(move |_, _| {
                *flag.lock() = true;
                true
            }),
            0,
        );

        assert!(!registry.run_init(&module("m"), &mut DetachedContext::default()));
        assert!(!*after_ran.lock());

        let stats = registry.stats();
        assert_eq!(stats.total_hooks, 2);
        assert_eq!(stats.executions, 1);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_filter_and_unregister() {
        let registry = HookRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);

        let id = registry.register_global(
            GlobalHooks::new()
                .filter(|path| path.starts_with("net."))
                .after_unload(move |m, _| sink.lock().push(m.path().to_string())),
            0,
        );

        let mut ctx = DetachedContext::default();
        registry.run_unload(&module("net.http"), &mut ctx);
        registry.run_unload(&module("fs"), &mut ctx);
        assert_eq!(*seen.lock(), vec!["net.http".to_string()]);

        assert!(registry.unregister_global(id));
        assert!(!registry.unregister_global(id));
        registry.run_unload(&module("net.tcp"), &mut ctx);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_error_and_first_use_hooks() {
        let registry = HookRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::clone(&log);
        let uses = Arc::clone(&log);

        registry.set_module_hooks(
            "m",
            ModuleHooks::new()
                .on_error(move |_, msg| errors.lock().push(format!("error: {}", msg)))
                .on_first_use(move |_, _| uses.lock().push("first use".to_string())),
        );

        let m = module("m");
        registry.run_first_use(&m, &mut DetachedContext::default());
        registry.run_error(&m, "boom");
        assert_eq!(*log.lock(), vec!["first use".to_string(), "error: boom".to_string()]);

        assert!(registry.remove_module_hooks("m"));
        assert!(registry.module_hooks("m").is_none());
    }

    #[test]
    fn test_script_init_hook() {
        let registry = HookRegistry::new();
        registry.set_script_init_hook("m", "setup");

        let m = module("m");
        // Missing function fails
        assert!(!registry.run_init(&m, &mut CallingContext));

        m.define("setup", Value::Native(NativeFunction::new("setup", |_| Ok(Value::Bool(true)))), true);
        assert!(registry.run_init(&m, &mut CallingContext));

        m.define("setup", Value::Native(NativeFunction::new("setup", |_| Ok(Value::Nil))), true);
        assert!(!registry.run_init(&m, &mut CallingContext));

        m.define("setup", Value::Native(NativeFunction::new("setup", |_| Ok(Value::Number(1.0)))), true);
        assert!(!registry.run_init(&m, &mut CallingContext));

        m.define("setup", Value::Native(NativeFunction::new("setup", |_| Ok(Value::Bool(false)))), true);
        assert!(!registry.run_init(&m, &mut CallingContext));

        // Without an engine the call cannot happen
        m.define("setup", Value::Native(NativeFunction::new("setup", |_| Ok(Value::Bool(true)))), true);
        assert!(!registry.run_init(&m, &mut DetachedContext::default()));
    }
}
