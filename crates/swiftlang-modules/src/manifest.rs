//! Package manifests (`module.json`) and the default package system

use crate::error::ManifestError;
use crate::host::PackageSystem;
use crate::native;
use crate::value::{ObjectRef, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File name of a package manifest
pub const MANIFEST_FILE: &str = "module.json";

/// How a package's code is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageKind {
    /// Source or compiled bytecode
    Bytecode,
    /// Dynamic library
    Native,
}

/// Kind of a declared export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportType {
    /// Callable
    Function,
    /// Constant value
    Constant,
    /// Mutable binding
    Variable,
    /// Class
    Class,
    /// Struct
    Struct,
    /// Trait
    Trait,
}

/// An export declared in the manifest
#[derive(Debug, Clone)]
pub struct ManifestExport {
    /// Export name
    pub name: String,
    /// Declared kind
    pub kind: ExportType,
    /// Type signature
    pub signature: Option<String>,
    /// Symbol in the package's native library (functions)
    pub native: Option<String>,
    /// Literal value (constants)
    pub value: Option<Value>,
}

/// A declared dependency
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Module name to load
    pub name: String,
    /// Semver requirement
    pub version: Option<String>,
    /// Failure to load is a warning rather than an error
    pub optional: bool,
}

/// A module declared inside a multi-module package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDefinition {
    /// Module name within the package
    pub name: String,
    /// Delivery kind
    pub kind: PackageKind,
    /// Source files, relative to the package root
    pub sources: Vec<String>,
    /// Entry file, relative to the package root
    pub main: Option<String>,
}

/// Everything the loader needs to build a package module
#[derive(Debug, Clone)]
pub struct PackageMetadata {
    /// Package (or `package/module`) name
    pub name: String,
    /// Semantic version
    pub version: Option<String>,
    /// Free-form description
    pub description: Option<String>,
    /// Delivery kind
    pub kind: PackageKind,
    /// Directory holding the manifest
    pub root: PathBuf,
    /// Entry source file, relative to `root`
    pub main: Option<PathBuf>,
    /// Compiled archive, relative to `root`
    pub archive: Option<PathBuf>,
    /// Native library, relative to `root`
    pub native_library: Option<PathBuf>,
    /// Declared exports, ordered by name
    pub exports: Vec<ManifestExport>,
    /// Declared dependencies, ordered by name
    pub dependencies: Vec<Dependency>,
    /// Declared submodules
    pub modules: Vec<ModuleDefinition>,
}

#[derive(Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    description: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    main: Option<String>,
    compiled: Option<String>,
    native: Option<RawNative>,
    native_library: Option<String>,
    #[serde(default)]
    exports: BTreeMap<String, RawExport>,
    #[serde(default)]
    dependencies: BTreeMap<String, RawDependency>,
    #[serde(default)]
    modules: Vec<RawModule>,
}

#[derive(Deserialize)]
struct RawNative {
    library: Option<String>,
}

#[derive(Deserialize)]
struct RawExport {
    #[serde(rename = "type")]
    kind: ExportType,
    signature: Option<String>,
    native: Option<String>,
    value: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Version(String),
    Detailed {
        version: Option<String>,
        #[serde(default)]
        optional: bool,
    },
}

#[derive(Deserialize)]
struct RawModule {
    name: String,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    sources: Vec<String>,
    main: Option<String>,
}

fn package_kind(kind: Option<&str>) -> PackageKind {
    match kind {
        Some("native") => PackageKind::Native,
        _ => PackageKind::Bytecode,
    }
}

/// Convert a JSON literal into a runtime value
pub fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Nil),
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => {
            let object = ObjectRef::new();
            for (index, item) in items.iter().enumerate() {
                object.set(&index.to_string(), json_to_value(item));
            }
            Value::Object(object)
        }
        serde_json::Value::Object(map) => {
            let object = ObjectRef::new();
            for (key, item) in map {
                object.set(key, json_to_value(item));
            }
            Value::Object(object)
        }
    }
}

impl PackageMetadata {
    /// Parse manifest JSON
    ///
    /// `root` is the directory relative paths are resolved against;
    /// `origin` is only used in error messages.
    pub fn from_json(bytes: &[u8], root: &Path, origin: &Path) -> Result<Self, ManifestError> {
        let raw: RawManifest =
            serde_json::from_slice(bytes).map_err(|source| ManifestError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;

        let name = match raw.name {
            Some(name) => name,
            None => root
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_string)
                .ok_or(ManifestError::MissingField {
                    path: origin.to_path_buf(),
                    field: "name",
                })?,
        };

        let exports = raw
            .exports
            .into_iter()
            .map(|(name, export)| ManifestExport {
                name,
                kind: export.kind,
                signature: export.signature,
                native: export.native,
                value: export.value.as_ref().map(json_to_value),
            })
            .collect();

        let dependencies = raw
            .dependencies
            .into_iter()
            .map(|(name, dep)| match dep {
                RawDependency::Version(version) => Dependency {
                    name,
                    version: Some(version),
                    optional: false,
                },
                RawDependency::Detailed { version, optional } => Dependency {
                    name,
                    version,
                    optional,
                },
            })
            .collect();

        let modules = raw
            .modules
            .into_iter()
            .map(|m| ModuleDefinition {
                name: m.name,
                kind: package_kind(m.kind.as_deref()),
                sources: m.sources,
                main: m.main,
            })
            .collect();

        Ok(PackageMetadata {
            name,
            version: raw.version,
            description: raw.description,
            kind: package_kind(raw.kind.as_deref()),
            root: root.to_path_buf(),
            main: raw.main.map(PathBuf::from),
            archive: raw.compiled.map(PathBuf::from),
            native_library: raw
                .native
                .and_then(|n| n.library)
                .or(raw.native_library)
                .map(PathBuf::from),
            exports,
            dependencies,
            modules,
        })
    }

    /// Read `<dir>/module.json`
    pub fn read(dir: &Path) -> Result<Self, ManifestError> {
        let path = dir.join(MANIFEST_FILE);
        let bytes = std::fs::read(&path).map_err(|source| ManifestError::Io {
            path: path.clone(),
            source,
        })?;
        Self::from_json(&bytes, dir, &path)
    }

    /// Resolve a path relative to the package root
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Entry source file, resolved
    pub fn main_path(&self) -> Option<PathBuf> {
        self.main.as_deref().map(|m| self.resolve(m))
    }

    /// Look up a declared submodule
    pub fn module(&self, name: &str) -> Option<&ModuleDefinition> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// Metadata for one declared submodule
    pub fn submodule_metadata(&self, name: &str) -> Option<PackageMetadata> {
        let definition = self.module(name)?;
        let entry = definition
            .main
            .clone()
            .or_else(|| definition.sources.first().cloned());

        let (main, native_library) = match definition.kind {
            PackageKind::Native => {
                let file = native::library_file_name(&definition.name);
                let library = ["build", "native", "."]
                    .iter()
                    .map(|dir| Path::new(dir).join(&file))
                    .find(|candidate| self.resolve(candidate).is_file())
                    .unwrap_or_else(|| Path::new("build").join(&file));
                (None, Some(library))
            }
            PackageKind::Bytecode => (entry.map(PathBuf::from), None),
        };

        Some(PackageMetadata {
            name: format!("{}/{}", self.name, definition.name),
            version: self.version.clone(),
            description: None,
            kind: definition.kind,
            root: self.root.clone(),
            main,
            archive: None,
            native_library,
            exports: Vec::new(),
            dependencies: Vec::new(),
            modules: Vec::new(),
        })
    }
}

/// Package system backed by `module.json` files under search paths
#[derive(Debug, Clone)]
pub struct ManifestPackageSystem {
    search_paths: Vec<PathBuf>,
}

impl ManifestPackageSystem {
    /// Look for packages as `<search path>/<name>/module.json`
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }

    /// Directories probed, in order
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    fn find(&self, name: &str) -> Option<PackageMetadata> {
        if name.is_empty() || name.contains('/') || name.starts_with(['@', '$', '.']) {
            return None;
        }
        for base in &self.search_paths {
            let dir = base.join(name);
            if !dir.join(MANIFEST_FILE).is_file() {
                continue;
            }
            match PackageMetadata::read(&dir) {
                Ok(metadata) => return Some(metadata),
                Err(err) => {
                    tracing::warn!(target: "swiftlang::packages", package = name, error = %err, "ignoring unreadable manifest");
                    return None;
                }
            }
        }
        None
    }
}

impl PackageSystem for ManifestPackageSystem {
    fn package(&self, name: &str) -> Option<PackageMetadata> {
        self.find(name)
    }

    fn submodule(&self, package: &str, module: &str) -> Option<PackageMetadata> {
        self.find(package)?.submodule_metadata(module)
    }
}
