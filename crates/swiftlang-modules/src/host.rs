//! Interfaces to the collaborators the loader drives
//!
//! The loader never parses source, interprets bytecode, reads zip files or
//! calls `dlopen` itself; it goes through these traits. Default
//! implementations for the last three live in [`crate::native`],
//! [`crate::archive`] and [`crate::manifest`].

use crate::error::{ArchiveError, LoadError, NativeError};
use crate::loader::ModuleLoader;
use crate::manifest::PackageMetadata;
use crate::module::{Module, ModuleState};
use crate::value::{NativeFunction, Value};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use swiftlang_bytecode::Chunk;

/// Name of the global a module body publishes its exports through
pub const EXPORTS_GLOBAL: &str = "__module_exports__";

/// Turns source text into a chunk
pub trait Compiler: Send + Sync {
    /// Compile `source`, read from `path`
    fn compile(&self, source: &str, path: &Path) -> Result<Chunk, String>;
}

/// Creates isolated execution contexts
pub trait Engine: Send + Sync {
    /// Fresh context with no globals defined
    fn new_context(&self) -> Box<dyn ExecutionContext>;
}

/// One isolated run of the bytecode engine
pub trait ExecutionContext {
    /// Bind a global
    fn define_global(&mut self, name: &str, value: Value);

    /// Run `chunk` to completion
    fn run(&mut self, chunk: &Chunk, scope: &ExecScope<'_>) -> Result<(), String>;

    /// Every global currently bound, in definition order
    fn globals(&self) -> Vec<(Arc<str>, Value)>;

    /// Call a callable value
    fn call(&mut self, callee: &Value, args: &[Value]) -> Result<Value, String>;
}

/// Context handed to hooks when no engine is attached
///
/// Defines globals but cannot run or call anything.
#[derive(Debug, Default)]
pub struct DetachedContext {
    globals: Vec<(Arc<str>, Value)>,
}

impl ExecutionContext for DetachedContext {
    fn define_global(&mut self, name: &str, value: Value) {
        match self.globals.iter_mut().find(|(key, _)| &**key == name) {
            Some(slot) => slot.1 = value,
            None => self.globals.push((Arc::from(name), value)),
        }
    }

    fn run(&mut self, _chunk: &Chunk, _scope: &ExecScope<'_>) -> Result<(), String> {
        Err("no execution engine attached".to_string())
    }

    fn globals(&self) -> Vec<(Arc<str>, Value)> {
        self.globals.clone()
    }

    fn call(&mut self, _callee: &Value, _args: &[Value]) -> Result<Value, String> {
        Err("no execution engine attached".to_string())
    }
}

/// What a running module body can reach
///
/// Bodies import their dependencies through [`ExecScope::import`]; the first
/// failed import is kept so the loader can report the root cause instead of
/// the engine's generic failure.
pub struct ExecScope<'a> {
    loader: &'a ModuleLoader,
    module: &'a Arc<Module>,
    import_error: Mutex<Option<LoadError>>,
}

impl<'a> ExecScope<'a> {
    pub(crate) fn new(loader: &'a ModuleLoader, module: &'a Arc<Module>) -> Self {
        Self {
            loader,
            module,
            import_error: Mutex::new(None),
        }
    }

    /// The loader running the body
    pub fn loader(&self) -> &ModuleLoader {
        self.loader
    }

    /// The module being executed
    pub fn module(&self) -> &Arc<Module> {
        self.module
    }

    /// Load and initialize a dependency relative to the running module
    pub fn import(&self, name: &str) -> Result<Arc<Module>, String> {
        let result = self
            .loader
            .load(name, false, Some(self.module.absolute_path()))
            .and_then(|module| {
                if module.state() == ModuleState::Unloaded {
                    self.loader.ensure_initialized(&module)?;
                }
                Ok(module)
            });

        result.map_err(|err| {
            let message = err.to_string();
            let mut slot = self.import_error.lock();
            if slot.is_none() {
                *slot = Some(err);
            }
            message
        })
    }

    pub(crate) fn take_import_error(&self) -> Option<LoadError> {
        self.import_error.lock().take()
    }
}

/// Looks up package metadata by name
pub trait PackageSystem: Send + Sync {
    /// Metadata for a whole package
    fn package(&self, name: &str) -> Option<PackageMetadata>;

    /// Metadata for one module declared inside a package
    fn submodule(&self, package: &str, module: &str) -> Option<PackageMetadata>;
}

/// Opens dynamic libraries
pub trait NativeLoader: Send + Sync {
    /// Open the library at `path`
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, NativeError>;
}

/// An opened dynamic library; closed when dropped
pub trait NativeLibrary: Send + Sync {
    /// Path the library was opened from
    fn path(&self) -> &Path;

    /// Check whether `symbol` resolves
    fn has_symbol(&self, symbol: &str) -> bool;

    /// Call an init function; `None` if the symbol is absent
    fn call_init(&self, symbol: &str, module: &Module) -> Option<bool>;

    /// Wrap an exported function; `None` if the symbol is absent
    fn function(&self, symbol: &str) -> Option<NativeFunction>;
}

/// Opens module archives
pub trait ArchiveOpener: Send + Sync {
    /// Open the archive at `path`
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>, ArchiveError>;
}

/// Read access to one module archive
pub trait ArchiveReader {
    /// Parsed `module.json`, if the archive has one
    fn metadata(&mut self) -> Result<Option<PackageMetadata>, ArchiveError>;

    /// Raw bytecode blob stored under `name`
    fn bytecode(&mut self, name: &str) -> Result<Option<Vec<u8>>, ArchiveError>;

    /// Every entry name in the archive
    fn entry_names(&self) -> Vec<String>;

    /// Native library built for `platform`, as `(file name, contents)`
    fn native_library(&mut self, platform: &str)
        -> Result<Option<(String, Vec<u8>)>, ArchiveError>;

    /// Names of the bytecode units in the archive
    fn bytecode_names(&self) -> Vec<String> {
        self.entry_names()
            .iter()
            .filter_map(|entry| entry.strip_prefix(crate::archive::BYTECODE_DIR))
            .filter_map(|rest| rest.rsplit_once('.').map(|(name, _)| name.to_string()))
            .filter(|name| !name.is_empty() && !name.contains('/'))
            .collect()
    }
}
