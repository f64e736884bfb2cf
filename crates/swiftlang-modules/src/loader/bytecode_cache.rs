//! On-disk cache of compiled source
//!
//! Entries are plain SWBC units named `<file name>-<mtime secs>.<ext>`, so
//! editing a source file orphans its old entry instead of serving it.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use swiftlang_bytecode::Chunk;

/// Directory of compiled chunks keyed by source name and modification time
#[derive(Debug, Clone)]
pub(crate) struct BytecodeCache {
    dir: PathBuf,
    extension: String,
}

impl BytecodeCache {
    pub(crate) fn new(dir: PathBuf, extension: &str) -> Self {
        Self {
            dir,
            extension: extension.to_string(),
        }
    }

    /// Cache file for `source`
    pub(crate) fn cache_path(&self, source: &Path) -> PathBuf {
        let mtime = std::fs::metadata(source)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.dir
            .join(format!("{}-{}.{}", name, mtime, self.extension))
    }

    /// Cached chunk for `source`
    ///
    /// A missing entry is a miss; so is an unreadable or corrupt one, which
    /// is logged and left to be overwritten.
    pub(crate) fn load(&self, source: &Path) -> Option<Chunk> {
        let path = self.cache_path(source);
        let bytes = std::fs::read(&path).ok()?;
        match Chunk::decode(&bytes) {
            Ok(chunk) => {
                tracing::debug!(target: "swiftlang::cache", path = %path.display(), "loaded cached bytecode");
                Some(chunk)
            }
            Err(err) => {
                tracing::warn!(target: "swiftlang::cache", path = %path.display(), error = %err, "discarding corrupt bytecode cache entry");
                None
            }
        }
    }

    /// Write the chunk compiled from `source`
    ///
    /// Failures are logged; the cache is an optimization.
    pub(crate) fn store(&self, source: &Path, chunk: &Chunk) {
        let path = self.cache_path(source);
        let result = std::fs::create_dir_all(&self.dir).and_then(|_| std::fs::write(&path, chunk.encode()));
        match result {
            Ok(()) => tracing::debug!(target: "swiftlang::cache", path = %path.display(), "stored bytecode"),
            Err(err) => {
                tracing::warn!(target: "swiftlang::cache", path = %path.display(), error = %err, "failed to write bytecode cache")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftlang_bytecode::Constant;
    use tempfile::TempDir;

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("util.swift");
        std::fs::write(&source, "export PI = 3.14159").unwrap();
        let cache = BytecodeCache::new(dir.path().join("cache"), "swiftbc");

        assert!(cache.load(&source).is_none());

        let mut chunk = Chunk::new();
        chunk.add_constant(Constant::Number(3.14159));
        chunk.write_with_line(0, 1);
        cache.store(&source, &chunk);

        let path = cache.cache_path(&source);
        let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(file_name.starts_with("util.swift-"));
        assert!(file_name.ends_with(".swiftbc"));
        assert_eq!(cache.load(&source), Some(chunk));
    }

    #[test]
    fn test_corrupt_entry_is_miss() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("util.swift");
        std::fs::write(&source, "export PI = 3.14159").unwrap();
        let cache = BytecodeCache::new(dir.path().to_path_buf(), "swiftbc");

        std::fs::write(cache.cache_path(&source), b"SWBC\x00\x00").unwrap();
        assert!(cache.load(&source).is_none());
    }
}
