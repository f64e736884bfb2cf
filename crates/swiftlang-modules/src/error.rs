//! Error types for module loading

use crate::module::ModuleState;
use std::path::PathBuf;
use swiftlang_bytecode::{CodecError, ContainerError};
use thiserror::Error;

/// Errors raised while resolving, loading or initializing a module
#[derive(Debug, Error)]
pub enum LoadError {
    /// No search path, package or cache entry matched
    #[error("Module not found: {path} (tried: {tried:?})")]
    NotFound {
        /// Requested module name
        path: String,
        /// Candidate paths probed, in order
        tried: Vec<PathBuf>,
    },

    /// A load re-entered a module that is still loading
    #[error("Circular dependency detected while loading {0}")]
    CircularDependency(String),

    /// Malformed chunk
    #[error("Failed to decode bytecode for {path}: {source}")]
    Decode {
        /// Module name
        path: String,
        /// Underlying codec error
        source: CodecError,
    },

    /// Malformed module container
    #[error("Invalid module container for {path}: {source}")]
    Container {
        /// Module name
        path: String,
        /// Underlying container error
        source: ContainerError,
    },

    /// The compiler rejected the source
    #[error("Compile error in {path}: {message}")]
    Compile {
        /// Module name
        path: String,
        /// Compiler diagnostic
        message: String,
    },

    /// The module body failed while running
    #[error("Execution of {path} failed: {message}")]
    Execution {
        /// Module name
        path: String,
        /// Engine diagnostic
        message: String,
    },

    /// A native module's init symbol was missing or returned false
    #[error("Native module {path} failed to initialize: {message}")]
    NativeInit {
        /// Module name
        path: String,
        /// What went wrong
        message: String,
    },

    /// Native library error
    #[error(transparent)]
    Native(#[from] NativeError),

    /// Archive error
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Package manifest error
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// An init hook rejected an otherwise loaded module
    #[error("Init hooks failed for {0}")]
    HookFailed(String),

    /// The module is in a state that does not permit the operation
    #[error("Module {path} is {state}")]
    InvalidState {
        /// Module name
        path: String,
        /// State observed
        state: ModuleState,
    },

    /// The module is pinned and cannot be unloaded
    #[error("Module {path} is in use ({ref_count} references)")]
    InUse {
        /// Module name
        path: String,
        /// Outstanding references
        ref_count: usize,
    },

    /// The loaded version does not satisfy the requirement
    #[error("Module {path} version {found} does not satisfy {required}")]
    VersionMismatch {
        /// Module name
        path: String,
        /// Requirement that was asked for
        required: String,
        /// Version the module declares (`none` if absent)
        found: String,
    },

    /// File I/O error
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the native library loader
#[derive(Debug, Error)]
pub enum NativeError {
    /// Library file not found or could not be loaded
    #[error("Library not found: {path}")]
    NotFound {
        /// Path that was attempted
        path: String,
    },

    /// Symbol not found in library
    #[error("Symbol not found: {symbol} in {library}")]
    SymbolNotFound {
        /// Symbol name that was not found
        symbol: String,
        /// Library path
        library: String,
    },

    /// Invalid path encoding
    #[error("Invalid UTF-8 in path: {0}")]
    InvalidPath(String),

    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Errors raised while reading a module archive
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// File I/O error
    #[error("Archive I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The zip layer rejected the file
    #[error("Invalid archive {path}: {source}")]
    Zip {
        /// Archive path
        path: PathBuf,
        /// Underlying zip error
        source: zip::result::ZipError,
    },

    /// A required entry is absent
    #[error("Archive {path} has no entry {entry}")]
    MissingEntry {
        /// Archive path
        path: PathBuf,
        /// Entry name
        entry: String,
    },

    /// The embedded module.json is malformed
    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Errors raised while reading a `module.json` manifest
#[derive(Debug, Error)]
pub enum ManifestError {
    /// File I/O error
    #[error("Failed to read manifest {path}: {source}")]
    Io {
        /// Manifest path
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// JSON syntax or schema error
    #[error("Invalid manifest {path}: {source}")]
    Parse {
        /// Manifest path
        path: PathBuf,
        /// Underlying JSON error
        source: serde_json::Error,
    },

    /// A field required by the operation is absent
    #[error("Manifest {path} is missing `{field}`")]
    MissingField {
        /// Manifest path
        path: PathBuf,
        /// Field name
        field: &'static str,
    },
}

/// Errors raised while reading loader configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error
    #[error("Failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML syntax or schema error
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Result alias for loader operations
pub type LoadResult<T> = Result<T, LoadError>;
