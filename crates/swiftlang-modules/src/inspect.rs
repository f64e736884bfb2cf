//! Introspection of loaded modules

use crate::loader::ModuleLoader;
use crate::module::{Module, ModuleKind, ModuleState};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Snapshot of one module
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleInfo {
    /// Logical path
    pub path: String,
    /// Resolved file or package directory
    pub absolute_path: PathBuf,
    /// Where the module came from
    pub kind: ModuleKind,
    /// Lifecycle state
    pub state: ModuleState,
    /// Declared version
    pub version: Option<String>,
    /// Outstanding pins
    pub ref_count: usize,
    /// Number of exported symbols
    pub export_count: usize,
    /// Exported symbol names
    pub exports: Vec<String>,
    /// A dynamic library is attached
    pub has_native_library: bool,
    /// Logical time of the last access
    pub last_access: u64,
    /// Failure message, in the `Error` state
    pub error: Option<String>,
}

/// Snapshot of one definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportInfo {
    /// Symbol name
    pub name: String,
    /// Visible to importers
    pub exported: bool,
    /// Type of the bound value
    pub type_name: &'static str,
}

impl Module {
    /// Describe this module
    pub fn info(&self) -> ModuleInfo {
        ModuleInfo {
            path: self.path().to_string(),
            absolute_path: self.absolute_path().to_path_buf(),
            kind: self.kind(),
            state: self.state(),
            version: self.version(),
            ref_count: self.ref_count(),
            export_count: self.export_count(),
            exports: self.export_names().iter().map(|n| n.to_string()).collect(),
            has_native_library: self.has_native_library(),
            last_access: self.last_access(),
            error: self.error(),
        }
    }

    /// Describe the definition `name`, exported or not
    pub fn export_info(&self, name: &str) -> Option<ExportInfo> {
        self.entries()
            .into_iter()
            .find(|entry| &*entry.name == name)
            .map(|entry| ExportInfo {
                name: entry.name.to_string(),
                exported: entry.exported,
                type_name: entry.value.type_name(),
            })
    }

    /// Pretty-printed JSON description
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.info())
    }
}

impl ModuleLoader {
    /// Every module this loader has cached, ordered by path
    pub fn loaded_modules(&self) -> Vec<Arc<Module>> {
        self.cache().modules()
    }

    /// Cached modules whose path matches a glob pattern
    pub fn find_by_pattern(&self, pattern: &str) -> Result<Vec<Arc<Module>>, glob::PatternError> {
        let pattern = glob::Pattern::new(pattern)?;
        Ok(self
            .loaded_modules()
            .into_iter()
            .filter(|module| pattern.matches(module.path()))
            .collect())
    }

    /// Cached modules exporting `name`
    pub fn find_by_export(&self, name: &str) -> Vec<Arc<Module>> {
        self.loaded_modules()
            .into_iter()
            .filter(|module| module.has_export(name))
            .collect()
    }

    /// JSON array describing every cached module
    pub fn to_json(&self) -> serde_json::Result<String> {
        let infos: Vec<ModuleInfo> = self.loaded_modules().iter().map(|m| m.info()).collect();
        serde_json::to_string_pretty(&infos)
    }
}
