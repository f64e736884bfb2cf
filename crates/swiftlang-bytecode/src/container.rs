//! Compiled module container (`SWMO`)
//!
//! Wraps an encoded chunk together with module metadata, the export and
//! import tables and native bindings. All integers are little-endian.
//!
//! ```text
//! header (28 bytes):
//!   magic "SWMO" | version u32 | flags u32 | section_count u32 | timestamp u64 | checksum u32
//! section table (9 bytes per entry):
//!   type u8 | size u32 | offset u32
//! section payloads, in table order; the last section is always END
//! ```
//!
//! The checksum is a CRC32 over the whole file with the checksum field
//! itself zeroed.

use crate::encoder::{ByteOrder, BytecodeReader, BytecodeWriter, DecodeError};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Magic number for module containers: "SWMO"
pub const MAGIC: [u8; 4] = *b"SWMO";

/// Current container version
pub const VERSION: u32 = 1;

/// Size of the fixed container header in bytes
pub const HEADER_SIZE: usize = 28;

/// Size of one section table entry in bytes
pub const SECTION_ENTRY_SIZE: usize = 9;

/// Byte offset of the checksum field within the header
pub const CHECKSUM_OFFSET: usize = 24;

/// Container errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ContainerError {
    /// Low-level read error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected SWMO, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported container version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Checksum stored in the header
        expected: u32,
        /// Checksum computed over the file
        actual: u32,
    },

    /// Unknown section type
    #[error("Unknown section type {0:#x}")]
    UnknownSection(u8),

    /// Section extends past the end of the file
    #[error("Section {index} ({offset}+{size}) exceeds file size {file_size}")]
    SectionOutOfBounds {
        /// Index in the section table
        index: usize,
        /// Declared offset
        offset: u32,
        /// Declared size
        size: u32,
        /// Actual file size
        file_size: usize,
    },

    /// A section that may appear once appeared twice
    #[error("Duplicate {0:?} section")]
    DuplicateSection(SectionKind),

    /// A required section is absent
    #[error("Missing {0:?} section")]
    MissingSection(SectionKind),

    /// The section table does not end with an END section
    #[error("Missing END section")]
    MissingEnd,

    /// Unknown export kind byte
    #[error("Invalid export kind {0}")]
    InvalidExportKind(u8),
}

/// Section types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SectionKind {
    /// Reserved header section
    Header = 0x01,
    /// Module name and version
    Metadata = 0x02,
    /// One exported symbol
    Exports = 0x03,
    /// One imported symbol
    Imports = 0x04,
    /// Encoded chunk
    Bytecode = 0x05,
    /// Debug information
    Debug = 0x06,
    /// One native binding
    Natives = 0x07,
    /// Shared constants
    Constants = 0x08,
    /// End marker
    End = 0xFF,
}

impl SectionKind {
    /// Convert a raw section type byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x01 => SectionKind::Header,
            0x02 => SectionKind::Metadata,
            0x03 => SectionKind::Exports,
            0x04 => SectionKind::Imports,
            0x05 => SectionKind::Bytecode,
            0x06 => SectionKind::Debug,
            0x07 => SectionKind::Natives,
            0x08 => SectionKind::Constants,
            0xFF => SectionKind::End,
            _ => return None,
        })
    }
}

/// Kind of an exported symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExportKind {
    /// Function export
    Function = 0,
    /// Mutable binding
    Variable = 1,
    /// Constant export
    Constant = 2,
    /// Class export
    Class = 3,
}

impl TryFrom<u8> for ExportKind {
    type Error = ContainerError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ExportKind::Function),
            1 => Ok(ExportKind::Variable),
            2 => Ok(ExportKind::Constant),
            3 => Ok(ExportKind::Class),
            other => Err(ContainerError::InvalidExportKind(other)),
        }
    }
}

/// Exported symbol entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportRecord {
    /// Symbol name
    pub name: String,
    /// Symbol kind
    pub kind: ExportKind,
    /// Offset into the bytecode section
    pub offset: u32,
    /// Type signature (may be empty)
    pub signature: String,
}

/// Imported symbol entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    /// Module the symbol comes from
    pub module: String,
    /// Imported symbol name
    pub name: String,
    /// Local alias
    pub alias: Option<String>,
}

/// Binding of an export to a symbol in a native library
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeBinding {
    /// Name the symbol is exported under
    pub export_name: String,
    /// Symbol name in the native library
    pub native_name: String,
    /// Type signature (may be empty)
    pub signature: String,
}

/// Section table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    /// Section type
    pub kind: SectionKind,
    /// Payload size in bytes
    pub size: u32,
    /// Payload offset from the start of the file
    pub offset: u32,
}

/// Builds a container in memory
#[derive(Debug, Default)]
pub struct ContainerWriter {
    flags: u32,
    sections: Vec<(SectionKind, Vec<u8>)>,
}

impl ContainerWriter {
    /// Create an empty writer
    pub fn new() -> Self {
        Self::default()
    }

    /// Set header flags
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    fn payload() -> BytecodeWriter {
        BytecodeWriter::with_order(ByteOrder::Little)
    }

    /// Append a raw section
    pub fn add_section(&mut self, kind: SectionKind, payload: Vec<u8>) {
        self.sections.push((kind, payload));
    }

    /// Append the METADATA section
    pub fn add_metadata(&mut self, name: &str, version: &str) {
        let mut w = Self::payload();
        w.emit_string(name);
        w.emit_string(version);
        self.add_section(SectionKind::Metadata, w.into_bytes());
    }

    /// Append one EXPORTS section
    pub fn add_export(&mut self, export: &ExportRecord) {
        let mut w = Self::payload();
        w.emit_string(&export.name);
        w.emit_u8(export.kind as u8);
        w.emit_u32(export.offset);
        w.emit_string(&export.signature);
        self.add_section(SectionKind::Exports, w.into_bytes());
    }

    /// Append one IMPORTS section
    pub fn add_import(&mut self, import: &ImportRecord) {
        let mut w = Self::payload();
        w.emit_string(&import.module);
        w.emit_string(&import.name);
        w.emit_string(import.alias.as_deref().unwrap_or(""));
        self.add_section(SectionKind::Imports, w.into_bytes());
    }

    /// Append the BYTECODE section holding an encoded chunk
    pub fn add_bytecode(&mut self, code: &[u8]) {
        self.add_section(SectionKind::Bytecode, code.to_vec());
    }

    /// Append one NATIVES section
    pub fn add_native_binding(&mut self, binding: &NativeBinding) {
        let mut w = Self::payload();
        w.emit_string(&binding.export_name);
        w.emit_string(&binding.native_name);
        w.emit_string(&binding.signature);
        self.add_section(SectionKind::Natives, w.into_bytes());
    }

    /// Finish the container with an explicit timestamp
    pub fn finish(mut self, timestamp: u64) -> Vec<u8> {
        self.sections.push((SectionKind::End, vec![0]));

        let section_count = self.sections.len();
        let mut w = BytecodeWriter::with_order(ByteOrder::Little);
        w.emit_bytes(&MAGIC);
        w.emit_u32(VERSION);
        w.emit_u32(self.flags);
        w.emit_u32(section_count as u32);
        w.emit_u64(timestamp);
        w.emit_u32(0);

        let mut offset = HEADER_SIZE + section_count * SECTION_ENTRY_SIZE;
        for (kind, payload) in &self.sections {
            w.emit_u8(*kind as u8);
            w.emit_u32(payload.len() as u32);
            w.emit_u32(offset as u32);
            offset += payload.len();
        }
        for (_, payload) in &self.sections {
            w.emit_bytes(payload);
        }

        let mut bytes = w.into_bytes();
        stamp_checksum(&mut bytes);
        bytes
    }

    /// Finish the container stamped with the current time and write it to `path`
    pub fn write_to(self, path: &Path) -> std::io::Result<()> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        std::fs::write(path, self.finish(timestamp))
    }
}

/// CRC32 of `data` with the checksum field treated as zero
pub fn compute_checksum(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    if data.len() < HEADER_SIZE {
        hasher.update(data);
        return hasher.finalize();
    }
    hasher.update(&data[..CHECKSUM_OFFSET]);
    hasher.update(&[0u8; 4]);
    hasher.update(&data[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}

/// Recompute and store the checksum after the file has been modified
pub fn stamp_checksum(data: &mut [u8]) {
    if data.len() < HEADER_SIZE {
        return;
    }
    let checksum = compute_checksum(data);
    data[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].copy_from_slice(&checksum.to_le_bytes());
}

/// Check the magic number and checksum of a container
pub fn verify(data: &[u8]) -> Result<(), ContainerError> {
    let mut reader = BytecodeReader::with_order(data, ByteOrder::Little);
    let mut magic = [0u8; 4];
    magic.copy_from_slice(reader.read_slice(4)?);
    if magic != MAGIC {
        return Err(ContainerError::InvalidMagic(magic));
    }
    reader.seek(CHECKSUM_OFFSET);
    let expected = reader.read_u32()?;
    let actual = compute_checksum(data);
    if expected != actual {
        return Err(ContainerError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

/// Check whether `data` starts with the container magic
pub fn is_container(data: &[u8]) -> bool {
    data.len() >= 4 && data[..4] == MAGIC
}

/// A parsed, checksum-verified container
#[derive(Debug, Clone)]
pub struct ContainerReader {
    version: u32,
    flags: u32,
    timestamp: u64,
    checksum: u32,
    sections: Vec<SectionEntry>,
    name: Option<String>,
    module_version: Option<String>,
    exports: Vec<ExportRecord>,
    imports: Vec<ImportRecord>,
    natives: Vec<NativeBinding>,
    bytecode: Option<Vec<u8>>,
}

impl ContainerReader {
    /// Parse a container held in memory
    pub fn parse(data: &[u8]) -> Result<Self, ContainerError> {
        verify(data)?;

        let mut reader = BytecodeReader::with_order(data, ByteOrder::Little);
        reader.seek(4);
        let version = reader.read_u32()?;
        if version != VERSION {
            return Err(ContainerError::UnsupportedVersion(version));
        }
        let flags = reader.read_u32()?;
        let section_count = reader.read_u32()? as usize;
        let timestamp = reader.read_u64()?;
        let checksum = reader.read_u32()?;

        let mut sections = Vec::with_capacity(section_count.min(reader.remaining() / SECTION_ENTRY_SIZE));
        for index in 0..section_count {
            let raw_kind = reader.read_u8()?;
            let kind = SectionKind::from_u8(raw_kind).ok_or(ContainerError::UnknownSection(raw_kind))?;
            let size = reader.read_u32()?;
            let offset = reader.read_u32()?;
            let end = offset as usize + size as usize;
            if end > data.len() {
                return Err(ContainerError::SectionOutOfBounds {
                    index,
                    offset,
                    size,
                    file_size: data.len(),
                });
            }
            sections.push(SectionEntry { kind, size, offset });
        }

        if sections.last().map(|s| s.kind) != Some(SectionKind::End) {
            return Err(ContainerError::MissingEnd);
        }

        let mut parsed = ContainerReader {
            version,
            flags,
            timestamp,
            checksum,
            sections: Vec::new(),
            name: None,
            module_version: None,
            exports: Vec::new(),
            imports: Vec::new(),
            natives: Vec::new(),
            bytecode: None,
        };

        for entry in &sections {
            let start = entry.offset as usize;
            let payload = &data[start..start + entry.size as usize];
            let mut r = BytecodeReader::with_order(payload, ByteOrder::Little);
            match entry.kind {
                SectionKind::Metadata => {
                    if parsed.name.is_some() {
                        return Err(ContainerError::DuplicateSection(SectionKind::Metadata));
                    }
                    parsed.name = Some(r.read_string()?);
                    parsed.module_version = Some(r.read_string()?);
                }
                SectionKind::Exports => {
                    let name = r.read_string()?;
                    let kind = ExportKind::try_from(r.read_u8()?)?;
                    let offset = r.read_u32()?;
                    let signature = r.read_string()?;
                    parsed.exports.push(ExportRecord {
                        name,
                        kind,
                        offset,
                        signature,
                    });
                }
                SectionKind::Imports => {
                    let module = r.read_string()?;
                    let name = r.read_string()?;
                    let alias = r.read_string()?;
                    parsed.imports.push(ImportRecord {
                        module,
                        name,
                        alias: if alias.is_empty() { None } else { Some(alias) },
                    });
                }
                SectionKind::Natives => {
                    parsed.natives.push(NativeBinding {
                        export_name: r.read_string()?,
                        native_name: r.read_string()?,
                        signature: r.read_string()?,
                    });
                }
                SectionKind::Bytecode => {
                    if parsed.bytecode.is_some() {
                        return Err(ContainerError::DuplicateSection(SectionKind::Bytecode));
                    }
                    parsed.bytecode = Some(payload.to_vec());
                }
                SectionKind::Header
                | SectionKind::Debug
                | SectionKind::Constants
                | SectionKind::End => {}
            }
        }

        parsed.sections = sections;
        Ok(parsed)
    }

    /// Read and parse a container file
    pub fn open(path: &Path) -> Result<Self, std::io::Error> {
        let data = std::fs::read(path)?;
        Self::parse(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Container format version
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Header flags
    pub fn flags(&self) -> u32 {
        self.flags
    }

    /// Creation timestamp (seconds since the Unix epoch)
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Stored checksum
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Section table
    pub fn sections(&self) -> &[SectionEntry] {
        &self.sections
    }

    /// Module name from the METADATA section
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Module version from the METADATA section
    pub fn module_version(&self) -> Option<&str> {
        self.module_version.as_deref()
    }

    /// Export table
    pub fn exports(&self) -> &[ExportRecord] {
        &self.exports
    }

    /// Find an export by name
    pub fn find_export(&self, name: &str) -> Option<&ExportRecord> {
        self.exports.iter().find(|e| e.name == name)
    }

    /// Import table
    pub fn imports(&self) -> &[ImportRecord] {
        &self.imports
    }

    /// Native bindings
    pub fn native_bindings(&self) -> &[NativeBinding] {
        &self.natives
    }

    /// Encoded chunk from the BYTECODE section
    pub fn bytecode(&self) -> Option<&[u8]> {
        self.bytecode.as_deref()
    }
}
