//! Module loader
//!
//! Resolves module names, executes each module once and caches the result.
//!
//! # Load Protocol
//! 1. Probe this loader's cache, then each parent's
//! 2. Ask the package system (application loaders only)
//! 3. Look for a cached compiled archive
//! 4. Resolve against the filesystem
//! 5. Insert the module in `Loading` state, then execute it
//!
//! A cache hit on a module still in `Loading` is a circular dependency.
//! Module bodies run with no cache lock held, so they may import freely.

mod bytecode_cache;
mod execute;
mod resolve;
mod unload;

use crate::archive::ZipArchiveOpener;
use crate::cache::{CacheStats, ModuleCache};
use crate::config::LoaderConfig;
use crate::context::RuntimeContext;
use crate::error::{LoadError, LoadResult};
use crate::host::{
    ArchiveOpener, Compiler, DetachedContext, Engine, ExecutionContext, NativeLoader,
    PackageSystem,
};
use crate::manifest::{ManifestPackageSystem, PackageMetadata};
use crate::module::{Module, ModuleState};
use crate::native::DylibLoader;
use crate::value::Value;
use bytecode_cache::BytecodeCache;
use resolve::{Resolved, Resolver};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Position of a loader in the hierarchy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderKind {
    /// Core modules
    Bootstrap,
    /// Standard library
    System,
    /// User program; the only kind that consults packages
    Application,
    /// Nested scope under another loader
    Child,
}

/// Where a load will come from
enum Target {
    File(Resolved),
    Package(PackageMetadata),
}

/// Builder for [`ModuleLoader`]
pub struct ModuleLoaderBuilder {
    kind: LoaderKind,
    parent: Option<Arc<ModuleLoader>>,
    config: LoaderConfig,
    search_paths: Vec<PathBuf>,
    compiler: Option<Arc<dyn Compiler>>,
    engine: Option<Arc<dyn Engine>>,
    packages: Option<Arc<dyn PackageSystem>>,
    natives: Option<Arc<dyn NativeLoader>>,
    archives: Option<Arc<dyn ArchiveOpener>>,
    context: Option<Arc<RuntimeContext>>,
}

impl ModuleLoaderBuilder {
    fn new(kind: LoaderKind) -> Self {
        Self {
            kind,
            parent: None,
            config: LoaderConfig::default(),
            search_paths: Vec::new(),
            compiler: None,
            engine: None,
            packages: None,
            natives: None,
            archives: None,
            context: None,
        }
    }

    /// Replace the configuration
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Search `path` before the configured search paths
    pub fn search_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.search_paths.push(path.into());
        self
    }

    /// Compiler for source modules
    pub fn compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Engine that runs module bodies
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Package system, replacing the `module.json` default
    pub fn package_system(mut self, packages: Arc<dyn PackageSystem>) -> Self {
        self.packages = Some(packages);
        self
    }

    /// Native library loader, replacing `dlopen`
    pub fn native_loader(mut self, natives: Arc<dyn NativeLoader>) -> Self {
        self.natives = Some(natives);
        self
    }

    /// Archive opener, replacing the zip reader
    pub fn archive_opener(mut self, archives: Arc<dyn ArchiveOpener>) -> Self {
        self.archives = Some(archives);
        self
    }

    /// Shared hooks and metrics
    pub fn context(mut self, context: Arc<RuntimeContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Build the loader
    pub fn build(self) -> ModuleLoader {
        let mut search_paths = self.search_paths;
        for path in self.config.effective_search_paths() {
            if !search_paths.contains(&path) {
                search_paths.push(path);
            }
        }

        let packages = if self.kind == LoaderKind::Application && self.config.enable_packages {
            Some(self.packages.unwrap_or_else(|| {
                Arc::new(ManifestPackageSystem::new(search_paths.clone())) as Arc<dyn PackageSystem>
            }))
        } else {
            None
        };

        let bytecode_cache = match (&self.config.cache_dir, self.config.bytecode_cache) {
            (Some(dir), true) => Some(BytecodeCache::new(dir.clone(), &self.config.bytecode_extension)),
            _ => None,
        };

        let archives = self.archives.unwrap_or_else(|| {
            Arc::new(ZipArchiveOpener::new(&self.config.bytecode_extension))
        });

        tracing::debug!(target: "swiftlang::loader", kind = ?self.kind, search_paths = search_paths.len(), "created module loader");

        ModuleLoader {
            kind: self.kind,
            parent: self.parent,
            cache: ModuleCache::new(),
            search_paths,
            compiler: self.compiler,
            engine: self.engine,
            packages,
            natives: self.natives.unwrap_or_else(|| Arc::new(DylibLoader::new())),
            archives,
            bytecode_cache,
            context: self.context.unwrap_or_default(),
            config: self.config,
            in_flight: AtomicUsize::new(0),
        }
    }
}

/// Loads, caches and unloads modules
pub struct ModuleLoader {
    kind: LoaderKind,
    parent: Option<Arc<ModuleLoader>>,
    cache: ModuleCache,
    search_paths: Vec<PathBuf>,
    config: LoaderConfig,
    compiler: Option<Arc<dyn Compiler>>,
    engine: Option<Arc<dyn Engine>>,
    packages: Option<Arc<dyn PackageSystem>>,
    natives: Arc<dyn NativeLoader>,
    archives: Arc<dyn ArchiveOpener>,
    bytecode_cache: Option<BytecodeCache>,
    context: Arc<RuntimeContext>,
    /// Loads past the cache probe that have not returned yet
    in_flight: AtomicUsize,
}

impl ModuleLoader {
    /// Start building a loader of `kind`
    pub fn builder(kind: LoaderKind) -> ModuleLoaderBuilder {
        ModuleLoaderBuilder::new(kind)
    }

    /// Start building a child of `parent`
    ///
    /// The child shares the parent's collaborators, configuration and
    /// runtime context but keeps its own cache.
    pub fn child(parent: &Arc<ModuleLoader>) -> ModuleLoaderBuilder {
        let mut builder = ModuleLoaderBuilder::new(LoaderKind::Child);
        builder.parent = Some(Arc::clone(parent));
        builder.config = LoaderConfig {
            search_paths: parent.search_paths.clone(),
            use_default_search_paths: false,
            ..parent.config.clone()
        };
        builder.compiler = parent.compiler.clone();
        builder.engine = parent.engine.clone();
        builder.natives = Some(Arc::clone(&parent.natives));
        builder.archives = Some(Arc::clone(&parent.archives));
        builder.context = Some(Arc::clone(&parent.context));
        builder
    }

    /// Loader kind
    pub fn kind(&self) -> LoaderKind {
        self.kind
    }

    /// Parent loader
    pub fn parent(&self) -> Option<&Arc<ModuleLoader>> {
        self.parent.as_ref()
    }

    /// This loader's cache
    pub fn cache(&self) -> &ModuleCache {
        &self.cache
    }

    /// Cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Search paths, in probe order
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    /// Hooks and metrics
    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.context
    }

    /// Check whether a package system is attached
    pub fn has_package_system(&self) -> bool {
        self.packages.is_some()
    }

    /// Look up a module in this loader's cache or a parent's
    ///
    /// Counts as a cache access but never loads anything.
    pub fn get_cached(&self, path: &str) -> Option<Arc<Module>> {
        self.cache
            .get(path)
            .or_else(|| self.parent.as_ref().and_then(|p| p.get_cached(path)))
    }

    /// Load a module
    ///
    /// `relative_to` is the importing file, for `./` and `../` names.
    pub fn load(
        &self,
        path: &str,
        is_native: bool,
        relative_to: Option<&Path>,
    ) -> LoadResult<Arc<Module>> {
        if let Some(module) = self.get_cached(path) {
            self.context.metrics().record_cache_hit(path);
            return Self::cached_result(module);
        }

        let guard = InFlight::enter(&self.in_flight);
        let started = Instant::now();
        let target = self.find(path, is_native, relative_to)?;
        let module = self.load_target(path, target)?;
        self.context.metrics().record_load(path, started.elapsed());

        // Only the outermost load trims
        if guard.leave() {
            if let Some(max) = self.config.max_cached_modules {
                let _pin = module.handle();
                for evicted in self.cache.evict_lru(max) {
                    self.unload_module(&evicted);
                }
            }
        }
        Ok(module)
    }

    /// Load a module and check its declared version against `requirement`
    pub fn load_versioned(&self, path: &str, requirement: &str) -> LoadResult<Arc<Module>> {
        let module = self.load(path, false, None)?;
        Self::check_version(&module, requirement)?;
        Ok(module)
    }

    /// Load several modules, returning how many succeeded
    ///
    /// Failures are logged and skipped.
    pub fn preload<I, S>(&self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut loaded = 0;
        for path in paths {
            match self.load(path.as_ref(), false, None) {
                Ok(_) => loaded += 1,
                Err(err) => {
                    tracing::warn!(target: "swiftlang::loader", module = path.as_ref(), error = %err, "preload failed")
                }
            }
        }
        loaded
    }

    /// Run a lazily loaded module's body if it has not run yet
    pub fn ensure_initialized(&self, module: &Arc<Module>) -> LoadResult<()> {
        let chunk = match module.begin_deferred_init() {
            Ok(chunk) => chunk,
            Err(ModuleState::Loaded) => return Ok(()),
            Err(ModuleState::Loading) => {
                return Err(LoadError::CircularDependency(module.path().to_string()))
            }
            Err(state) => {
                return Err(LoadError::InvalidState {
                    path: module.path().to_string(),
                    state,
                })
            }
        };

        tracing::debug!(target: "swiftlang::loader", module = %module.path(), "initializing lazy module");
        let started = Instant::now();
        let result = self.run_body(module, &chunk).and_then(|mut ctx| {
            self.finish_init(module, ctx.as_mut())?;
            self.context.hooks().run_first_use(module, ctx.as_mut());
            Ok(())
        });

        match result {
            Ok(()) => {
                self.context.metrics().record_init(module.path(), started.elapsed());
                Ok(())
            }
            Err(err) => {
                self.fail(module, &err);
                Err(err)
            }
        }
    }

    /// Look up an export, initializing a lazy module first
    pub fn get_export(&self, module: &Arc<Module>, name: &str) -> LoadResult<Option<Value>> {
        if module.state() == ModuleState::Unloaded && module.has_chunk() {
            self.ensure_initialized(module)?;
        }
        self.context.metrics().record_export_lookup(module.path());
        module.touch();
        Ok(module.get_export(name))
    }

    /// Trim this loader's cache, unloading what it evicts
    pub fn trim(&self, max_size: usize) -> usize {
        let evicted = self.cache.evict_lru(max_size);
        for module in &evicted {
            self.unload_module(module);
        }
        evicted.len()
    }

    fn cached_result(module: Arc<Module>) -> LoadResult<Arc<Module>> {
        match module.state() {
            ModuleState::Loading => {
                tracing::debug!(target: "swiftlang::loader", module = %module.path(), "circular dependency");
                Err(LoadError::CircularDependency(module.path().to_string()))
            }
            ModuleState::Error => Err(LoadError::InvalidState {
                path: module.path().to_string(),
                state: ModuleState::Error,
            }),
            ModuleState::Loaded | ModuleState::Unloaded => Ok(module),
        }
    }

    fn check_version(module: &Module, requirement: &str) -> LoadResult<()> {
        let satisfied = semver::VersionReq::parse(requirement)
            .map(|req| module.satisfies(&req))
            .unwrap_or(false);
        if satisfied {
            Ok(())
        } else {
            Err(LoadError::VersionMismatch {
                path: module.path().to_string(),
                required: requirement.to_string(),
                found: module.version().unwrap_or_else(|| "none".to_string()),
            })
        }
    }

    fn find(&self, path: &str, is_native: bool, relative_to: Option<&Path>) -> LoadResult<Target> {
        if let Some(packages) = self.packages.as_ref().filter(|_| !is_native) {
            let metadata = match path.split_once('/') {
                Some((package, module)) if !package.is_empty() && !path.starts_with('.') => {
                    packages.submodule(package, module)
                }
                Some(_) => None,
                None => packages.package(path),
            };
            if let Some(metadata) = metadata {
                tracing::debug!(target: "swiftlang::loader", module = path, package = %metadata.name, "resolved through package system");
                return Ok(Target::Package(metadata));
            }
        }

        let resolver = Resolver::new(&self.config, &self.search_paths);
        if !is_native {
            if let Some(archive) = resolver.find_cached_archive(path) {
                return Ok(Target::File(Resolved::Archive(archive)));
            }
        }
        resolver
            .resolve(path, is_native, relative_to)
            .map(Target::File)
    }

    fn load_target(&self, path: &str, target: Target) -> LoadResult<Arc<Module>> {
        let module = Arc::new(self.create_module(path, &target));
        module.set_state(ModuleState::Loading);

        // Visible before the body runs so re-entrant imports see `Loading`
        if let Err(existing) = self.cache.insert_if_absent(Arc::clone(&module)) {
            return Self::cached_result(existing);
        }

        tracing::debug!(target: "swiftlang::loader", module = path, kind = module.kind().as_str(), path = %module.absolute_path().display(), "loading module");
        match self.execute(&module, target) {
            Ok(()) => {
                tracing::debug!(target: "swiftlang::loader", module = path, state = %module.state(), exports = module.export_count(), "module ready");
                Ok(module)
            }
            Err(err) => {
                self.fail(&module, &err);
                Err(err)
            }
        }
    }

    /// Record a failure: release partial state, mark `Error`, fire hooks
    fn fail(&self, module: &Module, err: &LoadError) {
        let message = err.to_string();
        tracing::error!(target: "swiftlang::loader", module = %module.path(), error = %message, "module load failed");
        module.release();
        module.mark_failed(&message);
        self.context.hooks().run_error(module, &message);
    }

    /// Context for hooks that run outside a module body
    fn hook_context(&self) -> Box<dyn ExecutionContext> {
        match &self.engine {
            Some(engine) => engine.new_context(),
            None => Box::new(DetachedContext::default()),
        }
    }
}

impl std::fmt::Debug for ModuleLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLoader")
            .field("kind", &self.kind)
            .field("has_parent", &self.parent.is_some())
            .field("modules", &self.cache.len())
            .field("search_paths", &self.search_paths)
            .finish()
    }
}

/// Counts a load as in flight until it returns
struct InFlight<'a> {
    count: &'a AtomicUsize,
    active: bool,
}

impl<'a> InFlight<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self { count, active: true }
    }

    /// Leave early; true when no other load is still running
    fn leave(mut self) -> bool {
        self.active = false;
        self.count.fetch_sub(1, Ordering::SeqCst) == 1
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.active {
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
