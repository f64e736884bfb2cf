//! Executing modules by kind

use super::resolve::Resolved;
use super::{ModuleLoader, Target};
use crate::error::{ArchiveError, LoadError, LoadResult};
use crate::host::{ExecScope, ExecutionContext, NativeLibrary, EXPORTS_GLOBAL};
use crate::manifest::{ExportType, PackageMetadata};
use crate::module::{Module, ModuleKind, ModuleState};
use crate::native;
use crate::value::{ObjectRef, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swiftlang_bytecode::{container, Chunk, ContainerReader};

impl ModuleLoader {
    pub(super) fn create_module(&self, path: &str, target: &Target) -> Module {
        match target {
            Target::File(Resolved::Source(p)) => Module::new(path, p.clone(), ModuleKind::Source),
            Target::File(Resolved::Archive(p)) => Module::new(path, p.clone(), ModuleKind::Archive),
            Target::File(Resolved::Native(p)) => Module::new(path, p.clone(), ModuleKind::Native),
            Target::File(Resolved::Directory(p)) => Module::new(path, p.clone(), ModuleKind::Package),
            Target::Package(metadata) => Module::new(path, metadata.root.clone(), ModuleKind::Package),
        }
    }

    pub(super) fn execute(&self, module: &Arc<Module>, target: Target) -> LoadResult<()> {
        match target {
            Target::File(Resolved::Native(path)) => self.load_native(module, &path),
            Target::File(Resolved::Archive(path)) => self.load_archive(module, &path),
            Target::File(Resolved::Source(path)) => self.load_source(module, &path),
            Target::File(Resolved::Directory(dir)) => {
                let mut metadata = PackageMetadata::read(&dir)?;
                if metadata.main.is_none() && metadata.archive.is_none() {
                    let default_main = PathBuf::from(format!("main.{}", self.config.source_extension));
                    if dir.join(&default_main).is_file() {
                        metadata.main = Some(default_main);
                    }
                }
                self.load_package(module, &metadata)
            }
            Target::Package(metadata) => self.load_package(module, &metadata),
        }
    }

    /// Run a chunk in a fresh context and capture what it produced
    ///
    /// Exports come from the `__module_exports__` object; every other
    /// global becomes a private definition.
    pub(super) fn run_body(
        &self,
        module: &Arc<Module>,
        chunk: &Chunk,
    ) -> LoadResult<Box<dyn ExecutionContext>> {
        let engine = self.engine.as_ref().ok_or_else(|| LoadError::Execution {
            path: module.path().to_string(),
            message: "no execution engine attached".to_string(),
        })?;

        let mut ctx = engine.new_context();
        let exports = ObjectRef::new();
        for entry in module.entries() {
            ctx.define_global(&entry.name, entry.value);
        }
        ctx.define_global(EXPORTS_GLOBAL, Value::Object(exports.clone()));

        let scope = ExecScope::new(self, module);
        if let Err(message) = ctx.run(chunk, &scope) {
            // Report the import that broke the body rather than the symptom
            return Err(scope.take_import_error().unwrap_or(LoadError::Execution {
                path: module.path().to_string(),
                message,
            }));
        }

        for (name, value) in exports.properties() {
            module.define(&name, value, true);
        }

        let globals: Vec<_> = ctx
            .globals()
            .into_iter()
            .filter(|(name, _)| &**name != EXPORTS_GLOBAL)
            .collect();
        for (name, value) in &globals {
            if !module.has_export(name) {
                module.define(name, value.clone(), false);
            }
        }
        module.set_globals(globals);

        tracing::trace!(target: "swiftlang::loader", module = %module.path(), exports = module.export_count(), "body executed");
        Ok(ctx)
    }

    /// Mark the module loaded and run init hooks
    pub(super) fn finish_init(&self, module: &Module, ctx: &mut dyn ExecutionContext) -> LoadResult<()> {
        module.set_state(ModuleState::Loaded);
        if self.context.hooks().run_init(module, ctx) {
            Ok(())
        } else {
            Err(LoadError::HookFailed(module.path().to_string()))
        }
    }

    /// Call the module's native init symbol
    ///
    /// The specific `<prefix>_<name>_module_init` is tried before the
    /// generic `<prefix>_module_init`.
    fn init_native(&self, module: &Module, library: &dyn NativeLibrary, required: bool) -> LoadResult<()> {
        let [specific, generic] = native::init_symbols(&self.config.native_symbol_prefix, module.path());
        let outcome = library
            .call_init(&specific, module)
            .or_else(|| library.call_init(&generic, module));

        match outcome {
            Some(true) => Ok(()),
            Some(false) => Err(LoadError::NativeInit {
                path: module.path().to_string(),
                message: "init function returned false".to_string(),
            }),
            None if required => Err(LoadError::NativeInit {
                path: module.path().to_string(),
                message: format!("missing init function (tried {} and {})", specific, generic),
            }),
            None => Ok(()),
        }
    }

    fn load_native(&self, module: &Arc<Module>, path: &Path) -> LoadResult<()> {
        let library = self.natives.open(path)?;
        self.init_native(module, library.as_ref(), true)?;
        module.attach_native(library, None);

        let mut ctx = self.hook_context();
        self.finish_init(module, ctx.as_mut())
    }

    /// Read an archive's metadata, native library and primary chunk
    fn read_archive(&self, module: &Arc<Module>, path: &Path) -> LoadResult<Chunk> {
        let mut reader = self.archives.open(path)?;

        let metadata = reader.metadata()?;
        if let Some(metadata) = &metadata {
            if module.version().is_none() {
                module.set_version(metadata.version.clone());
            }
        }

        if let Some((file_name, bytes)) = reader.native_library(&native::current_platform())? {
            self.attach_extracted_library(module, &file_name, &bytes)?;
        }

        let requested = module.path().trim_start_matches('@');
        let requested = if Path::new(requested).is_absolute() || requested.starts_with('.') {
            path.file_stem().and_then(|s| s.to_str()).unwrap_or(requested)
        } else {
            requested
        };
        let mut candidates = vec![
            format!("{}.{}", self.config.archive_entry_prefix, requested),
            requested.to_string(),
        ];
        if let Some(name) = metadata.as_ref().map(|m| m.name.as_str()) {
            for candidate in [format!("{}.{}", self.config.archive_entry_prefix, name), name.to_string()] {
                if !candidates.contains(&candidate) {
                    candidates.push(candidate);
                }
            }
        }

        let mut bytes = None;
        for candidate in &candidates {
            if let Some(found) = reader.bytecode(candidate)? {
                tracing::trace!(target: "swiftlang::loader", module = %module.path(), entry = %candidate, "found archive entry");
                bytes = Some(found);
                break;
            }
        }
        let bytes = bytes.ok_or_else(|| ArchiveError::MissingEntry {
            path: path.to_path_buf(),
            entry: candidates[0].clone(),
        })?;

        self.decode_unit(module, &bytes)
    }

    /// Decode a raw SWBC unit or the bytecode section of an SWMO container
    fn decode_unit(&self, module: &Module, bytes: &[u8]) -> LoadResult<Chunk> {
        let container;
        let unit = if container::is_container(bytes) {
            container = ContainerReader::parse(bytes).map_err(|source| LoadError::Container {
                path: module.path().to_string(),
                source,
            })?;
            if module.version().is_none() {
                module.set_version(container.module_version().map(str::to_string));
            }
            container.bytecode().ok_or_else(|| LoadError::Container {
                path: module.path().to_string(),
                source: container::ContainerError::MissingSection(container::SectionKind::Bytecode),
            })?
        } else {
            bytes
        };

        Chunk::decode(unit).map_err(|source| LoadError::Decode {
            path: module.path().to_string(),
            source,
        })
    }

    /// Write an archived native library to a temporary file and open it
    fn attach_extracted_library(&self, module: &Module, file_name: &str, bytes: &[u8]) -> LoadResult<()> {
        let extension = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(native::library_extension());
        let stem: String = module
            .path()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        let target = std::env::temp_dir().join(format!(
            "swiftlang_{}_{}.{}",
            stem,
            std::process::id(),
            extension
        ));

        std::fs::write(&target, bytes)?;
        let opened = self
            .natives
            .open(&target)
            .map_err(LoadError::from)
            .and_then(|library| {
                self.init_native(module, library.as_ref(), false)?;
                Ok(library)
            });
        match opened {
            Ok(library) => {
                tracing::debug!(target: "swiftlang::loader", module = %module.path(), library = %target.display(), "extracted native library");
                module.attach_native(library, Some(target));
                Ok(())
            }
            Err(err) => {
                let _ = std::fs::remove_file(&target);
                Err(err)
            }
        }
    }

    fn load_archive(&self, module: &Arc<Module>, path: &Path) -> LoadResult<()> {
        let chunk = self.read_archive(module, path)?;

        if self.config.lazy {
            tracing::debug!(target: "swiftlang::loader", module = %module.path(), "deferring execution");
            module.set_chunk(Arc::new(chunk));
            module.set_state(ModuleState::Unloaded);
            return Ok(());
        }

        let mut ctx = self.run_body(module, &chunk)?;
        self.finish_init(module, ctx.as_mut())
    }

    /// Chunk for a source file, from the bytecode cache or the compiler
    fn compile_source(&self, module: &Module, path: &Path) -> LoadResult<Chunk> {
        if let Some(chunk) = self.bytecode_cache.as_ref().and_then(|cache| cache.load(path)) {
            return Ok(chunk);
        }

        let compiler = self.compiler.as_ref().ok_or_else(|| LoadError::Compile {
            path: module.path().to_string(),
            message: "no compiler attached".to_string(),
        })?;
        let source = std::fs::read_to_string(path)?;
        let chunk = compiler
            .compile(&source, path)
            .map_err(|message| LoadError::Compile {
                path: module.path().to_string(),
                message,
            })?;

        if let Some(cache) = &self.bytecode_cache {
            cache.store(path, &chunk);
        }
        Ok(chunk)
    }

    fn load_source(&self, module: &Arc<Module>, path: &Path) -> LoadResult<()> {
        let chunk = self.compile_source(module, path)?;
        let mut ctx = self.run_body(module, &chunk)?;
        self.finish_init(module, ctx.as_mut())
    }

    /// Build a module from package metadata
    ///
    /// Order: dependencies, native library, manifest exports, compiled
    /// archive, main source, init hooks.
    fn load_package(&self, module: &Arc<Module>, metadata: &PackageMetadata) -> LoadResult<()> {
        module.set_version(metadata.version.clone());

        for dependency in &metadata.dependencies {
            let loaded = self
                .load(&dependency.name, false, Some(metadata.root.as_path()))
                .and_then(|dep| {
                    if dep.state() == ModuleState::Unloaded {
                        self.ensure_initialized(&dep)?;
                    }
                    if let Some(requirement) = &dependency.version {
                        Self::check_version(&dep, requirement)?;
                    }
                    Ok(dep)
                });
            match loaded {
                Ok(_) => {}
                Err(err) if dependency.optional => {
                    tracing::warn!(target: "swiftlang::loader", module = %module.path(), dependency = %dependency.name, error = %err, "skipping optional dependency");
                }
                Err(err) => return Err(err),
            }
        }

        if let Some(library) = &metadata.native_library {
            let library = self.natives.open(&metadata.resolve(library))?;
            self.init_native(module, library.as_ref(), false)?;
            module.attach_native(library, None);
        }

        for export in &metadata.exports {
            match export.kind {
                ExportType::Function => {
                    let Some(symbol) = &export.native else { continue };
                    match module.native_function(symbol) {
                        Some(function) => module.define(&export.name, Value::Native(function), true),
                        None => {
                            tracing::warn!(target: "swiftlang::loader", module = %module.path(), symbol = %symbol, "native function not found")
                        }
                    }
                }
                _ => {
                    if let Some(value) = &export.value {
                        module.define(&export.name, value.clone(), true);
                    }
                }
            }
        }

        let mut ctx = None;
        if let Some(archive) = &metadata.archive {
            let chunk = self.read_archive(module, &metadata.resolve(archive))?;
            ctx = Some(self.run_body(module, &chunk)?);
        }
        if let Some(main) = metadata.main_path() {
            let chunk = self.compile_source(module, &main)?;
            ctx = Some(self.run_body(module, &chunk)?);
        }

        let mut ctx = ctx.unwrap_or_else(|| self.hook_context());
        self.finish_init(module, ctx.as_mut())
    }
}
