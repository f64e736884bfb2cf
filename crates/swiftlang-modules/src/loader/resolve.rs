//! Module path resolution
//!
//! Maps a requested module name onto a file, directory or library.
//!
//! # Resolution Order
//! - `@name`: per search path `name/module.json`, `name.<archive>`,
//!   `modules/name.<archive>`, `name.<source>`; then the working directory
//! - `$name` (or a native request): `native/<lib>` and `<lib>` per search
//!   path, falling back to the bare library name for the system loader
//! - absolute paths verbatim
//! - `./x`, `../x`: next to the importing file, as-is then with the source
//!   extension
//! - `a.b.c`: per search path `a/b/c/module.json`, `a/b/c`, `a/b/c.<source>`,
//!   `a.b.c.<source>`, `a.b.c.<archive>`; then `a.b.c.<archive>` in the
//!   working directory

use crate::config::LoaderConfig;
use crate::error::LoadError;
use crate::manifest::MANIFEST_FILE;
use crate::native;
use std::path::{Path, PathBuf};

/// What a module name resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolved {
    /// Source file to compile
    Source(PathBuf),
    /// Directory carrying a `module.json`
    Directory(PathBuf),
    /// Zip archive
    Archive(PathBuf),
    /// Dynamic library
    Native(PathBuf),
}

impl Resolved {
    pub(crate) fn path(&self) -> &Path {
        match self {
            Resolved::Source(p) | Resolved::Directory(p) | Resolved::Archive(p) | Resolved::Native(p) => p,
        }
    }
}

/// Resolves names against a search path list
pub(crate) struct Resolver<'a> {
    config: &'a LoaderConfig,
    search_paths: &'a [PathBuf],
}

impl<'a> Resolver<'a> {
    pub(crate) fn new(config: &'a LoaderConfig, search_paths: &'a [PathBuf]) -> Self {
        Self {
            config,
            search_paths,
        }
    }

    /// Resolve `name`, importing from `relative_to` if given
    pub(crate) fn resolve(
        &self,
        name: &str,
        is_native: bool,
        relative_to: Option<&Path>,
    ) -> Result<Resolved, LoadError> {
        let mut tried = Vec::new();

        let found = if let Some(local) = name.strip_prefix('@') {
            self.resolve_local(local, &mut tried)
        } else if is_native || name.starts_with('$') {
            Some(self.resolve_native(name.trim_start_matches('$'), &mut tried))
        } else if Path::new(name).is_absolute() {
            let path = PathBuf::from(name);
            tried.push(path.clone());
            path.exists().then(|| self.classify(path))
        } else if name.starts_with("./") || name.starts_with("../") {
            self.resolve_relative(name, relative_to, &mut tried)
        } else {
            self.resolve_dotted(name, &mut tried)
        };

        match found {
            Some(resolved) => {
                tracing::trace!(target: "swiftlang::resolve", module = name, path = %resolved.path().display(), "resolved");
                Ok(resolved)
            }
            None => Err(LoadError::NotFound {
                path: name.to_string(),
                tried,
            }),
        }
    }

    fn source_file(&self, base: &Path, stem: &str) -> PathBuf {
        base.join(format!("{}.{}", stem, self.config.source_extension))
    }

    fn archive_file(&self, base: &Path, stem: &str) -> PathBuf {
        base.join(format!("{}.{}", stem, self.config.archive_extension))
    }

    /// Classify an existing path by what it holds
    pub(crate) fn classify(&self, path: PathBuf) -> Resolved {
        if path.is_dir() {
            Resolved::Directory(path)
        } else if path.extension().and_then(|e| e.to_str()) == Some(self.config.archive_extension.as_str()) {
            Resolved::Archive(path)
        } else if native::is_library_path(&path) {
            Resolved::Native(path)
        } else {
            Resolved::Source(path)
        }
    }

    fn probe(&self, candidate: PathBuf, tried: &mut Vec<PathBuf>) -> Option<Resolved> {
        tried.push(candidate.clone());
        candidate.is_file().then(|| self.classify(candidate))
    }

    fn probe_package_dir(&self, dir: PathBuf, tried: &mut Vec<PathBuf>) -> Option<Resolved> {
        let manifest = dir.join(MANIFEST_FILE);
        tried.push(manifest.clone());
        manifest.is_file().then_some(Resolved::Directory(dir))
    }

    fn resolve_local(&self, name: &str, tried: &mut Vec<PathBuf>) -> Option<Resolved> {
        for base in self.search_paths {
            if let Some(found) = self
                .probe_package_dir(base.join(name), tried)
                .or_else(|| self.probe(self.archive_file(base, name), tried))
                .or_else(|| self.probe(self.archive_file(&base.join("modules"), name), tried))
                .or_else(|| self.probe(self.source_file(base, name), tried))
            {
                return Some(found);
            }
        }
        self.probe(self.archive_file(Path::new(""), name), tried)
            .or_else(|| self.probe(self.archive_file(Path::new("modules"), name), tried))
    }

    fn resolve_native(&self, name: &str, tried: &mut Vec<PathBuf>) -> Resolved {
        let direct = Path::new(name);
        if direct.is_absolute() || native::is_library_path(direct) {
            tried.push(direct.to_path_buf());
            if direct.is_file() {
                return Resolved::Native(direct.to_path_buf());
            }
        }

        let file = native::library_file_name(name);
        for base in self.search_paths {
            for candidate in [base.join("native").join(&file), base.join(&file)] {
                tried.push(candidate.clone());
                if candidate.is_file() {
                    return Resolved::Native(candidate);
                }
            }
        }

        // Let the system loader search its own paths
        Resolved::Native(PathBuf::from(file))
    }

    fn resolve_relative(
        &self,
        name: &str,
        relative_to: Option<&Path>,
        tried: &mut Vec<PathBuf>,
    ) -> Option<Resolved> {
        let dir = match relative_to {
            Some(importer) if importer.is_dir() => importer.to_path_buf(),
            Some(importer) => importer.parent().unwrap_or(Path::new(".")).to_path_buf(),
            None => PathBuf::from("."),
        };

        let exact = dir.join(name);
        if let Some(found) = self.probe_package_dir(exact.clone(), tried) {
            return Some(found);
        }
        let with_extension = PathBuf::from(format!(
            "{}.{}",
            exact.display(),
            self.config.source_extension
        ));
        self.probe(exact, tried)
            .or_else(|| self.probe(with_extension, tried))
    }

    fn resolve_dotted(&self, name: &str, tried: &mut Vec<PathBuf>) -> Option<Resolved> {
        let converted: PathBuf = name.split('.').collect();
        let converted_str = converted.to_string_lossy().into_owned();

        for base in self.search_paths {
            if let Some(found) = self
                .probe_package_dir(base.join(&converted), tried)
                .or_else(|| self.probe(base.join(&converted), tried))
                .or_else(|| self.probe(self.source_file(base, &converted_str), tried))
                .or_else(|| self.probe(self.source_file(base, name), tried))
                .or_else(|| self.probe(self.archive_file(base, name), tried))
            {
                return Some(found);
            }
        }
        self.probe(self.archive_file(Path::new(""), name), tried)
    }

    /// Newest cached archive for `name`
    ///
    /// Looks for `<name>-*.<archive>` in the project cache, then the user
    /// cache; "newest" is the last match in file-name order.
    pub(crate) fn find_cached_archive(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty() || name.starts_with(['.', '/', '$', '@']) {
            return None;
        }

        let dirs = [
            Some(self.config.project_cache_dir.clone()),
            self.config.user_cache_dir(),
        ];
        for dir in dirs.into_iter().flatten() {
            let pattern = format!(
                "{}/{}-*.{}",
                glob::Pattern::escape(&dir.to_string_lossy()),
                glob::Pattern::escape(name),
                glob::Pattern::escape(&self.config.archive_extension)
            );
            let Ok(paths) = glob::glob(&pattern) else {
                continue;
            };
            let mut matches: Vec<PathBuf> = paths.flatten().filter(|p| p.is_file()).collect();
            matches.sort();
            if let Some(newest) = matches.pop() {
                tracing::debug!(target: "swiftlang::resolve", module = name, archive = %newest.display(), "found cached archive");
                return Some(newest);
            }
        }
        None
    }
}
