//! Unloading and teardown

use super::ModuleLoader;
use crate::error::{LoadError, LoadResult};
use crate::module::{Module, ModuleState};

impl ModuleLoader {
    /// Run unload hooks and release everything the module holds
    pub(super) fn unload_module(&self, module: &Module) {
        if module.state() == ModuleState::Loaded {
            let mut ctx = self.hook_context();
            self.context.hooks().run_unload(module, ctx.as_mut());
        }
        module.release();
        tracing::debug!(target: "swiftlang::loader", module = %module.path(), "module unloaded");
    }

    /// Whether `module` could be unloaded right now
    pub fn can_unload(&self, module: &Module) -> bool {
        module.can_unload()
    }

    /// Unload `module` regardless of references
    ///
    /// Outstanding [`crate::ModuleHandle`]s keep the `Arc` alive but see an
    /// empty, `Unloaded` module.
    pub fn force_unload(&self, module: &Module) {
        if !module.can_unload() {
            tracing::warn!(target: "swiftlang::loader", module = %module.path(), refs = module.ref_count(), state = %module.state(), "force unloading module");
        }
        self.cache.remove(module.path());
        self.unload_module(module);
    }

    /// Remove `path` from the cache and unload it
    ///
    /// Returns `false` if it was not cached by this loader.
    pub fn unload(&self, path: &str) -> bool {
        match self.cache.remove(path) {
            Some(module) => {
                self.unload_module(&module);
                true
            }
            None => false,
        }
    }

    /// Unload `path` only if nothing holds it and it is not mid-load
    pub fn try_unload(&self, path: &str) -> LoadResult<()> {
        let module = self.cache.peek(path).ok_or_else(|| LoadError::NotFound {
            path: path.to_string(),
            tried: Vec::new(),
        })?;

        match module.state() {
            state @ (ModuleState::Loading | ModuleState::Error) => {
                return Err(LoadError::InvalidState {
                    path: path.to_string(),
                    state,
                })
            }
            _ => {}
        }
        let refs = module.ref_count();
        if refs > 0 {
            return Err(LoadError::InUse {
                path: path.to_string(),
                ref_count: refs,
            });
        }

        self.unload(path);
        Ok(())
    }

    /// Unload every module this loader cached, returning how many
    ///
    /// The parent's cache is left alone.
    pub fn unload_all(&self) -> usize {
        let modules = self.cache.clear();
        for module in &modules {
            self.unload_module(module);
        }
        if !modules.is_empty() {
            tracing::debug!(target: "swiftlang::loader", count = modules.len(), "unloaded all modules");
        }
        modules.len()
    }
}

impl Drop for ModuleLoader {
    fn drop(&mut self) {
        self.unload_all();
    }
}
