//! Loaded module records

use crate::host::NativeLibrary;
use crate::symbol_table::SymbolTable;
use crate::value::{NativeFunction, Value};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swiftlang_bytecode::Chunk;

/// Process-wide logical clock for access ordering
static ACCESS_CLOCK: AtomicU64 = AtomicU64::new(0);

/// Next value of the access clock; strictly increasing
pub(crate) fn next_tick() -> u64 {
    ACCESS_CLOCK.fetch_add(1, Ordering::SeqCst) + 1
}

/// Lifecycle state of a module
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Not executed (fresh, lazy, or unloaded)
    #[default]
    Unloaded,
    /// Body is executing; re-entry means a cycle
    Loading,
    /// Executed successfully
    Loaded,
    /// Failed to load or initialize
    Error,
}

impl ModuleState {
    /// Lowercase name of the state
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Unloaded => "unloaded",
            ModuleState::Loading => "loading",
            ModuleState::Loaded => "loaded",
            ModuleState::Error => "error",
        }
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a module came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleKind {
    /// Compiled from a source file
    Source,
    /// Read from a compiled archive
    Archive,
    /// Dynamically loaded library
    Native,
    /// Assembled from package metadata
    Package,
}

impl ModuleKind {
    /// Lowercase name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKind::Source => "source",
            ModuleKind::Archive => "archive",
            ModuleKind::Native => "native",
            ModuleKind::Package => "package",
        }
    }
}

/// One definition in a module's export view
#[derive(Debug, Clone, PartialEq)]
pub struct ExportEntry {
    /// Symbol name
    pub name: Arc<str>,
    /// Bound value
    pub value: Value,
    /// Visible to importers
    pub exported: bool,
}

#[derive(Default)]
struct ModuleData {
    state: ModuleState,
    version: Option<String>,
    error: Option<String>,
    scope: SymbolTable,
    exports: Vec<ExportEntry>,
    export_index: FxHashMap<Arc<str>, usize>,
    globals: Vec<(Arc<str>, Value)>,
    chunk: Option<Arc<Chunk>>,
    native: Option<Box<dyn NativeLibrary>>,
    temp_native_path: Option<PathBuf>,
}

/// A loaded (or loading) compilation unit
///
/// State and data sit behind one lock, the reference count behind another,
/// and the access tick is atomic, so cache bookkeeping never contends with
/// pinning or with readers of the export table.
pub struct Module {
    path: String,
    absolute_path: PathBuf,
    kind: ModuleKind,
    data: RwLock<ModuleData>,
    ref_count: Mutex<usize>,
    last_access: AtomicU64,
}

impl Module {
    /// Create an empty module in the `Unloaded` state
    pub fn new(path: &str, absolute_path: impl Into<PathBuf>, kind: ModuleKind) -> Self {
        Self {
            path: path.to_string(),
            absolute_path: absolute_path.into(),
            kind,
            data: RwLock::new(ModuleData::default()),
            ref_count: Mutex::new(0),
            last_access: AtomicU64::new(next_tick()),
        }
    }

    /// Logical path (the cache key)
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Resolved filesystem path
    pub fn absolute_path(&self) -> &Path {
        &self.absolute_path
    }

    /// Origin of the module
    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Check whether the module is a native library
    pub fn is_native(&self) -> bool {
        self.kind == ModuleKind::Native
    }

    // ===== State =====

    /// Current lifecycle state
    pub fn state(&self) -> ModuleState {
        self.data.read().state
    }

    /// Set the lifecycle state
    pub fn set_state(&self, state: ModuleState) {
        self.data.write().state = state;
    }

    /// Mark the module failed and record why
    pub fn mark_failed(&self, message: &str) {
        let mut data = self.data.write();
        data.state = ModuleState::Error;
        data.error = Some(message.to_string());
    }

    /// Message recorded by the last failure
    pub fn error(&self) -> Option<String> {
        self.data.read().error.clone()
    }

    /// Declared semantic version
    pub fn version(&self) -> Option<String> {
        self.data.read().version.clone()
    }

    /// Set the declared version
    pub fn set_version(&self, version: Option<String>) {
        self.data.write().version = version;
    }

    /// Check the declared version against a requirement
    ///
    /// A module without a parseable version satisfies nothing.
    pub fn satisfies(&self, requirement: &semver::VersionReq) -> bool {
        self.version()
            .and_then(|v| semver::Version::parse(&v).ok())
            .map(|v| requirement.matches(&v))
            .unwrap_or(false)
    }

    // ===== Scope and exports =====

    /// Define a symbol in the module scope
    pub fn define(&self, name: &str, value: Value, exported: bool) {
        let mut data = self.data.write();
        data.scope.define(name, value.clone(), exported);

        let existing = data.export_index.get(name).copied();
        if let Some(index) = existing {
            let entry = &mut data.exports[index];
            entry.value = value;
            entry.exported = exported;
            return;
        }

        let name: Arc<str> = Arc::from(name);
        let index = data.exports.len();
        data.exports.push(ExportEntry {
            name: Arc::clone(&name),
            value,
            exported,
        });
        data.export_index.insert(name, index);
    }

    /// Value of an exported symbol
    pub fn get_export(&self, name: &str) -> Option<Value> {
        let data = self.data.read();
        let index = *data.export_index.get(name)?;
        let entry = &data.exports[index];
        entry.exported.then(|| entry.value.clone())
    }

    /// Check whether `name` is exported
    pub fn has_export(&self, name: &str) -> bool {
        self.data.read().scope.is_exported(name)
    }

    /// Value of any symbol in scope, exported or not
    pub fn lookup(&self, name: &str) -> Option<Value> {
        self.data.read().scope.get(name).cloned()
    }

    /// Every definition in definition order
    pub fn entries(&self) -> Vec<ExportEntry> {
        self.data.read().exports.clone()
    }

    /// Names of exported symbols in definition order
    pub fn export_names(&self) -> Vec<Arc<str>> {
        self.data
            .read()
            .exports
            .iter()
            .filter(|e| e.exported)
            .map(|e| Arc::clone(&e.name))
            .collect()
    }

    /// Number of exported symbols
    pub fn export_count(&self) -> usize {
        self.data.read().exports.iter().filter(|e| e.exported).count()
    }

    /// Run `f` against the module scope
    pub fn with_scope<R>(&self, f: impl FnOnce(&SymbolTable) -> R) -> R {
        f(&self.data.read().scope)
    }

    /// Globals captured after the body ran
    pub fn globals(&self) -> Vec<(Arc<str>, Value)> {
        self.data.read().globals.clone()
    }

    /// Look up one captured global
    pub fn global(&self, name: &str) -> Option<Value> {
        self.data
            .read()
            .globals
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value.clone())
    }

    /// Replace the captured globals
    pub fn set_globals(&self, globals: Vec<(Arc<str>, Value)>) {
        self.data.write().globals = globals;
    }

    // ===== Lazy chunk =====

    /// Retain a decoded chunk for deferred execution
    pub fn set_chunk(&self, chunk: Arc<Chunk>) {
        self.data.write().chunk = Some(chunk);
    }

    /// Check whether a chunk is awaiting execution
    pub fn has_chunk(&self) -> bool {
        self.data.read().chunk.is_some()
    }

    /// Claim the retained chunk for execution
    ///
    /// Succeeds only for an `Unloaded` module holding a chunk, moving it to
    /// `Loading` in the same critical section; otherwise reports the state
    /// that blocked it.
    pub(crate) fn begin_deferred_init(&self) -> Result<Arc<Chunk>, ModuleState> {
        let mut data = self.data.write();
        if data.state != ModuleState::Unloaded {
            return Err(data.state);
        }
        let chunk = data.chunk.take().ok_or(data.state)?;
        data.state = ModuleState::Loading;
        Ok(chunk)
    }

    // ===== Native library =====

    /// Attach an opened native library
    ///
    /// `temp_path` names an extracted copy to delete when the module is
    /// released.
    pub fn attach_native(&self, library: Box<dyn NativeLibrary>, temp_path: Option<PathBuf>) {
        let mut data = self.data.write();
        data.native = Some(library);
        data.temp_native_path = temp_path;
    }

    /// Check whether a native library is attached
    pub fn has_native_library(&self) -> bool {
        self.data.read().native.is_some()
    }

    /// Path of the attached native library
    pub fn native_library_path(&self) -> Option<PathBuf> {
        self.data
            .read()
            .native
            .as_ref()
            .map(|lib| lib.path().to_path_buf())
    }

    /// Resolve a function exported by the attached native library
    pub fn native_function(&self, symbol: &str) -> Option<NativeFunction> {
        self.data.read().native.as_ref()?.function(symbol)
    }

    /// Path of the extracted temporary native library, if any
    pub fn temp_native_path(&self) -> Option<PathBuf> {
        self.data.read().temp_native_path.clone()
    }

    // ===== Reference counting =====

    /// Pin the module against unload and eviction
    pub fn ref_module(&self) {
        *self.ref_count.lock() += 1;
    }

    /// Release one pin; never drops below zero
    pub fn unref(&self) {
        let mut count = self.ref_count.lock();
        *count = count.saturating_sub(1);
    }

    /// Current number of pins
    pub fn ref_count(&self) -> usize {
        *self.ref_count.lock()
    }

    /// Pin the module for the lifetime of the returned guard
    pub fn handle(self: &Arc<Self>) -> ModuleHandle {
        ModuleHandle::new(Arc::clone(self))
    }

    /// Check whether the module may be destructively unloaded
    pub fn can_unload(&self) -> bool {
        !matches!(self.state(), ModuleState::Loading | ModuleState::Error) && self.ref_count() == 0
    }

    // ===== Access tracking =====

    /// Record an access
    pub fn touch(&self) {
        self.last_access.store(next_tick(), Ordering::SeqCst);
    }

    /// Tick of the last access
    pub fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::SeqCst)
    }

    /// Free everything the module holds and return it to `Unloaded`
    pub(crate) fn release(&self) {
        let (library, temp_path) = {
            let mut data = self.data.write();
            data.scope = SymbolTable::new();
            data.exports.clear();
            data.export_index.clear();
            data.globals.clear();
            data.chunk = None;
            data.state = ModuleState::Unloaded;
            (data.native.take(), data.temp_native_path.take())
        };
        // Close the library before deleting its backing file
        drop(library);
        if let Some(path) = temp_path {
            remove_temp_library(&path);
        }
    }
}

fn remove_temp_library(path: &Path) {
    if let Err(err) = std::fs::remove_file(path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(target: "swiftlang::module", path = %path.display(), error = %err, "failed to remove extracted native library");
        }
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        let data = self.data.get_mut();
        drop(data.native.take());
        if let Some(path) = data.temp_native_path.take() {
            remove_temp_library(&path);
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data.read();
        f.debug_struct("Module")
            .field("path", &self.path)
            .field("absolute_path", &self.absolute_path)
            .field("kind", &self.kind)
            .field("state", &data.state)
            .field("version", &data.version)
            .field("exports", &data.exports.len())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

/// RAII pin on a module
///
/// Increments the reference count on creation and decrements it on drop.
pub struct ModuleHandle {
    module: Arc<Module>,
}

impl ModuleHandle {
    /// Pin `module`
    pub fn new(module: Arc<Module>) -> Self {
        module.ref_module();
        Self { module }
    }

    /// The pinned module
    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }
}

impl Deref for ModuleHandle {
    type Target = Module;

    fn deref(&self) -> &Module {
        &self.module
    }
}

impl Clone for ModuleHandle {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.module))
    }
}

impl Drop for ModuleHandle {
    fn drop(&mut self) {
        self.module.unref();
    }
}

impl fmt::Debug for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ModuleHandle").field(&self.module.path).finish()
    }
}
