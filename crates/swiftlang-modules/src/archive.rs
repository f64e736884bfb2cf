//! Zip-backed module archives (`.swiftmodule`)
//!
//! Layout:
//!
//! ```text
//! module.json
//! bytecode/<name>.swiftbc        chunk or SWMO container
//! native/<platform>/<library>
//! ```

use crate::error::ArchiveError;
use crate::host::{ArchiveOpener, ArchiveReader};
use crate::manifest::{PackageMetadata, MANIFEST_FILE};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use zip::result::ZipError;

/// Directory holding bytecode entries
pub const BYTECODE_DIR: &str = "bytecode/";

/// Directory holding per-platform native libraries
pub const NATIVE_DIR: &str = "native/";

/// Opens `.swiftmodule` zip archives
#[derive(Debug, Clone)]
pub struct ZipArchiveOpener {
    bytecode_extension: String,
}

impl ZipArchiveOpener {
    /// Opener expecting `bytecode/<name>.<bytecode_extension>` entries
    pub fn new(bytecode_extension: &str) -> Self {
        Self {
            bytecode_extension: bytecode_extension.to_string(),
        }
    }
}

impl Default for ZipArchiveOpener {
    fn default() -> Self {
        Self::new("swiftbc")
    }
}

impl ArchiveOpener for ZipArchiveOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn ArchiveReader>, ArchiveError> {
        let file = File::open(path)?;
        let archive = zip::ZipArchive::new(file).map_err(|source| ArchiveError::Zip {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::trace!(target: "swiftlang::archive", path = %path.display(), entries = archive.len(), "opened archive");
        Ok(Box::new(ZipArchiveReader {
            path: path.to_path_buf(),
            archive,
            bytecode_extension: self.bytecode_extension.clone(),
        }))
    }
}

/// Largest buffer reserved up front for an entry
const MAX_PREALLOCATION: u64 = 1 << 20;

/// Buffer to reserve for an entry whose header declares `declared` bytes
///
/// The header is untrusted; larger entries grow the buffer while reading.
fn initial_capacity(declared: u64) -> usize {
    declared.min(MAX_PREALLOCATION) as usize
}

/// Reader over one opened zip archive
pub struct ZipArchiveReader {
    path: PathBuf,
    archive: zip::ZipArchive<File>,
    bytecode_extension: String,
}

impl ZipArchiveReader {
    /// Read an entry, `None` if it does not exist
    fn read_entry(&mut self, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        let mut entry = match self.archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Ok(None),
            Err(source) => {
                return Err(ArchiveError::Zip {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut bytes = Vec::with_capacity(initial_capacity(entry.size()));
        entry.read_to_end(&mut bytes)?;
        Ok(Some(bytes))
    }
}

impl ArchiveReader for ZipArchiveReader {
    fn metadata(&mut self) -> Result<Option<PackageMetadata>, ArchiveError> {
        let Some(bytes) = self.read_entry(MANIFEST_FILE)? else {
            return Ok(None);
        };
        let root = self.path.parent().unwrap_or(Path::new(".")).to_path_buf();
        let origin = self.path.join(MANIFEST_FILE);
        Ok(Some(PackageMetadata::from_json(&bytes, &root, &origin)?))
    }

    fn bytecode(&mut self, name: &str) -> Result<Option<Vec<u8>>, ArchiveError> {
        let entry = format!("{}{}.{}", BYTECODE_DIR, name, self.bytecode_extension);
        self.read_entry(&entry)
    }

    fn entry_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.archive.file_names().map(str::to_string).collect();
        names.sort();
        names
    }

    fn native_library(
        &mut self,
        platform: &str,
    ) -> Result<Option<(String, Vec<u8>)>, ArchiveError> {
        let prefix = format!("{}{}/", NATIVE_DIR, platform);
        let Some(entry) = self
            .entry_names()
            .into_iter()
            .find(|name| name.len() > prefix.len() && name.starts_with(&prefix) && !name.ends_with('/'))
        else {
            return Ok(None);
        };
        let file_name = entry[prefix.len()..].to_string();
        let bytes = self.read_entry(&entry)?.ok_or_else(|| ArchiveError::MissingEntry {
            path: self.path.clone(),
            entry: entry.clone(),
        })?;
        Ok(Some((file_name, bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use swiftlang_bytecode::{Chunk, Constant};
    use tempfile::TempDir;

    fn write_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        for (name, bytes) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(bytes).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_declared_entry_size_is_capped() {
        assert_eq!(initial_capacity(0), 0);
        assert_eq!(initial_capacity(512), 512);
        assert_eq!(initial_capacity(u64::MAX), MAX_PREALLOCATION as usize);
    }

    #[test]
    fn test_entry_larger_than_preallocation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.swiftmodule");
        let payload = vec![7u8; MAX_PREALLOCATION as usize + 4096];
        write_archive(&path, &[("bytecode/big.swiftbc", payload.as_slice())]);

        let mut reader = ZipArchiveOpener::default().open(&path).unwrap();
        assert_eq!(reader.bytecode("big").unwrap(), Some(payload));
    }

    #[test]
    fn test_read_archive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("geometry.swiftmodule");

        let mut chunk = Chunk::new();
        chunk.add_constant(Constant::Number(2.0));
        let encoded = chunk.encode();
        let platform_entry = format!("native/{}/libgeometry.so", crate::native::current_platform());

        write_archive(
            &path,
            &[
                ("module.json", br#"{"name": "geometry", "version": "0.1.0"}"#.as_slice()),
                ("bytecode/swift.geometry.swiftbc", encoded.as_slice()),
                ("bytecode/helpers.swiftbc", encoded.as_slice()),
                (platform_entry.as_str(), b"\x7fELF".as_slice()),
            ],
        );

        let mut reader = ZipArchiveOpener::default().open(&path).unwrap();
        let meta = reader.metadata().unwrap().unwrap();
        assert_eq!(meta.name, "geometry");
        assert_eq!(meta.version.as_deref(), Some("0.1.0"));

        assert_eq!(reader.bytecode("swift.geometry").unwrap(), Some(encoded.clone()));
        assert_eq!(reader.bytecode("missing").unwrap(), None);

        let mut names = reader.bytecode_names();
        names.sort();
        assert_eq!(names, vec!["helpers".to_string(), "swift.geometry".to_string()]);

        let (file, bytes) = reader
            .native_library(&crate::native::current_platform())
            .unwrap()
            .unwrap();
        assert_eq!(file, "libgeometry.so");
        assert_eq!(bytes, b"\x7fELF");
        assert!(reader.native_library("plan9-mips").unwrap().is_none());
    }

    #[test]
    fn test_archive_without_manifest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bare.swiftmodule");
        write_archive(&path, &[("bytecode/bare.swiftbc", b"SWBC".as_slice())]);

        let mut reader = ZipArchiveOpener::default().open(&path).unwrap();
        assert!(reader.metadata().unwrap().is_none());
    }

    #[test]
    fn test_not_a_zip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.swiftmodule");
        std::fs::write(&path, b"definitely not a zip").unwrap();

        assert!(matches!(
            ZipArchiveOpener::default().open(&path),
            Err(ArchiveError::Zip { .. })
        ));
    }
}
