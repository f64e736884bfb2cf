//! Swiftlang Module System
//!
//! Resolution, loading, caching and unloading of swiftlang modules:
//! - **Cache**: thread-safe module cache with LRU trimming (`cache`)
//! - **Loader**: hierarchical loaders that resolve names, compile or decode
//!   units and run module bodies (`loader`)
//! - **Packages**: `module.json` manifests and zip archives (`manifest`, `archive`)
//! - **Native**: dynamically loaded libraries (`native`)
//! - **Context**: lifecycle hooks and load metrics (`context`)
//!
//! The compiler and execution engine are supplied by the embedder through
//! the traits in [`host`].
//!
//! # Example
//!
//! ```rust,ignore
//! use swiftlang_modules::{LoaderKind, ModuleLoader};
//!
//! let loader = ModuleLoader::builder(LoaderKind::Application)
//!     .search_path("./lib")
//!     .compiler(compiler)
//!     .engine(engine)
//!     .build();
//!
//! let util = loader.load("util", false, None)?;
//! let pi = loader.get_export(&util, "PI")?;
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod archive;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod inspect;
pub mod loader;
pub mod manifest;
pub mod module;
pub mod native;
pub mod symbol_table;
pub mod value;

pub use archive::ZipArchiveOpener;
pub use cache::{CacheStats, ModuleCache};
pub use config::LoaderConfig;
pub use context::{
    GlobalHooks, HookId, HookRegistry, HookStats, MetricsRegistry, ModuleHooks, ModuleMetrics,
    RuntimeContext,
};
pub use error::{ArchiveError, ConfigError, LoadError, LoadResult, ManifestError, NativeError};
pub use host::{
    ArchiveOpener, ArchiveReader, Compiler, DetachedContext, Engine, ExecScope, ExecutionContext,
    NativeLibrary, NativeLoader, PackageSystem, EXPORTS_GLOBAL,
};
pub use inspect::{ExportInfo, ModuleInfo};
pub use loader::{LoaderKind, ModuleLoader, ModuleLoaderBuilder};
pub use manifest::{ManifestPackageSystem, PackageMetadata};
pub use module::{ExportEntry, Module, ModuleHandle, ModuleKind, ModuleState};
pub use native::DylibLoader;
pub use symbol_table::SymbolTable;
pub use value::{NativeFunction, ObjectRef, Value};

pub use swiftlang_bytecode as bytecode;
