//! Bytecode chunk format (`SWBC`)
//!
//! A chunk is a constant pool, an instruction stream and an optional
//! per-instruction line table. Function constants embed their own chunk as a
//! length-prefixed nested `SWBC` unit, so the format is recursive.
//!
//! Layout (all integers big-endian):
//!
//! ```text
//! "SWBC" | version u32 | flags u32 | header_size u32
//! constant_count u32 | (tag u8, payload)*
//! code_len u32 | code bytes
//! line_count u32 | line u32 * line_count      (line_count is 0 or code_len)
//! ```
//!
//! Decoding accepts at most [`MAX_NESTING_DEPTH`] levels of nested function
//! chunks; [`Chunk::nesting_depth`] reports how deep a chunk goes before it is
//! encoded.

use crate::encoder::{BytecodeReader, BytecodeWriter, DecodeError};
use crate::interner::StringInterner;
use std::sync::Arc;
use thiserror::Error;

/// Magic number for chunk blobs: "SWBC"
pub const MAGIC: [u8; 4] = *b"SWBC";

/// Current chunk format version
pub const VERSION: u32 = 1;

/// Size of the fixed chunk header in bytes
pub const HEADER_SIZE: u32 = 16;

/// Maximum depth of nested function chunks accepted by the decoder
pub const MAX_NESTING_DEPTH: usize = 64;

/// Chunk flags
pub mod flags {
    /// Chunk was compiled with debug information
    pub const DEBUG: u32 = 1 << 0;
}

/// Constant type tags
pub mod tags {
    /// `nil`
    pub const NIL: u8 = 0;
    /// Boolean, one byte payload
    pub const BOOL: u8 = 1;
    /// IEEE-754 double
    pub const NUMBER: u8 = 2;
    /// Length-prefixed UTF-8 string
    pub const STRING: u8 = 3;
    /// Reserved for heap objects; never valid in a serialized pool
    pub const OBJECT: u8 = 4;
    /// Function prototype with a nested chunk
    pub const FUNCTION: u8 = 5;
}

/// Chunk encoding/decoding errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CodecError {
    /// Low-level read error
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Invalid magic number
    #[error("Invalid magic number: expected SWBC, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported version
    #[error("Unsupported version: {0} (current: {VERSION})")]
    UnsupportedVersion(u32),

    /// Header declares a size smaller than the fixed header
    #[error("Invalid header size: {0}")]
    InvalidHeaderSize(u32),

    /// Constant pool entry with an unknown or unsupported tag
    #[error("Unknown constant tag {tag} at offset {offset}")]
    UnknownConstantTag {
        /// Tag byte found in the stream
        tag: u8,
        /// Offset of the tag byte
        offset: usize,
    },

    /// Line table whose length matches neither zero nor the code length
    #[error("Line table has {lines} entries for {code} bytes of code")]
    LineTableMismatch {
        /// Number of line entries declared
        lines: u32,
        /// Number of code bytes
        code: usize,
    },

    /// Bytes left over after a complete chunk
    #[error("{0} trailing bytes after chunk")]
    TrailingBytes(usize),

    /// Function chunks nested deeper than [`MAX_NESTING_DEPTH`]
    #[error("Function nesting exceeds {MAX_NESTING_DEPTH} levels")]
    NestingTooDeep,
}

/// A constant pool entry
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    /// `nil`
    Nil,
    /// Boolean literal
    Bool(bool),
    /// Numeric literal
    Number(f64),
    /// String literal (interned on decode)
    String(Arc<str>),
    /// Compiled function
    Function(Arc<FunctionProto>),
}

impl Constant {
    /// Construct a string constant
    pub fn string(value: &str) -> Self {
        Constant::String(Arc::from(value))
    }

    /// Type tag written for this constant
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Nil => tags::NIL,
            Constant::Bool(_) => tags::BOOL,
            Constant::Number(_) => tags::NUMBER,
            Constant::String(_) => tags::STRING,
            Constant::Function(_) => tags::FUNCTION,
        }
    }
}

/// A compiled function: signature plus its own chunk
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionProto {
    /// Function name (empty for anonymous functions)
    pub name: Arc<str>,
    /// Number of declared parameters
    pub arity: u32,
    /// Number of captured upvalues
    pub upvalue_count: u32,
    /// Function body
    pub chunk: Chunk,
}

impl FunctionProto {
    /// Create a function prototype
    pub fn new(name: &str, arity: u32, upvalue_count: u32, chunk: Chunk) -> Self {
        Self {
            name: Arc::from(name),
            arity,
            upvalue_count,
            chunk,
        }
    }
}

/// A compiled code unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Chunk {
    /// Header flags
    pub flags: u32,
    /// Constant pool
    pub constants: Vec<Constant>,
    // Only grown through `write`/`write_with_line`, so `lines` is either
    // absent or exactly as long as `code`
    code: Vec<u8>,
    lines: Option<Vec<u32>>,
}

impl Chunk {
    /// Create an empty chunk
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a constant and return its index
    pub fn add_constant(&mut self, constant: Constant) -> u32 {
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    /// Append an instruction byte without line information
    pub fn write(&mut self, byte: u8) {
        self.code.push(byte);
        if let Some(lines) = &mut self.lines {
            lines.push(0);
        }
    }

    /// Append an instruction byte tagged with its source line
    ///
    /// The first call on a chunk with existing untracked code back-fills
    /// line 0 for earlier bytes.
    pub fn write_with_line(&mut self, byte: u8, line: u32) {
        let code_len = self.code.len();
        let lines = self.lines.get_or_insert_with(|| vec![0; code_len]);
        lines.push(line);
        self.code.push(byte);
    }

    /// Instruction stream
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Source line per instruction byte, when recorded
    pub fn lines(&self) -> Option<&[u32]> {
        self.lines.as_deref()
    }

    /// Levels of function chunks nested below this one
    pub fn nesting_depth(&self) -> usize {
        self.constants
            .iter()
            .filter_map(|constant| match constant {
                Constant::Function(function) => Some(function.chunk.nesting_depth() + 1),
                _ => None,
            })
            .max()
            .unwrap_or(0)
    }

    /// Source line of the instruction at `offset`
    pub fn line_at(&self, offset: usize) -> Option<u32> {
        self.lines.as_ref()?.get(offset).copied()
    }

    /// Number of code bytes
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the chunk has no code
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Encode the chunk to its binary form
    pub fn encode(&self) -> Vec<u8> {
        let mut writer = BytecodeWriter::with_capacity(64 + self.code.len() * 5);
        self.encode_into(&mut writer);
        writer.into_bytes()
    }

    fn encode_into(&self, writer: &mut BytecodeWriter) {
        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(self.flags);
        writer.emit_u32(HEADER_SIZE);

        writer.emit_u32(self.constants.len() as u32);
        for constant in &self.constants {
            writer.emit_u8(constant.tag());
            match constant {
                Constant::Nil => {}
                Constant::Bool(value) => writer.emit_u8(u8::from(*value)),
                Constant::Number(value) => writer.emit_f64(*value),
                Constant::String(value) => writer.emit_string(value),
                Constant::Function(function) => {
                    writer.emit_string(&function.name);
                    writer.emit_u32(function.arity);
                    writer.emit_u32(function.upvalue_count);
                    writer.emit_blob(&function.chunk.encode());
                }
            }
        }

        writer.emit_blob(&self.code);

        match &self.lines {
            Some(lines) => {
                writer.emit_u32(lines.len() as u32);
                for &line in lines {
                    writer.emit_u32(line);
                }
            }
            None => writer.emit_u32(0),
        }
    }

    /// Decode a chunk, interning strings in a private pool
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let mut interner = StringInterner::new();
        Self::decode_with(data, &mut interner)
    }

    /// Decode a chunk, interning strings through `interner`
    pub fn decode_with(data: &[u8], interner: &mut StringInterner) -> Result<Self, CodecError> {
        decode_at_depth(data, interner, 0)
    }
}

fn decode_at_depth(
    data: &[u8],
    interner: &mut StringInterner,
    depth: usize,
) -> Result<Chunk, CodecError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(CodecError::NestingTooDeep);
    }

    let mut reader = BytecodeReader::new(data);

    let mut magic = [0u8; 4];
    magic.copy_from_slice(reader.read_slice(4)?);
    if magic != MAGIC {
        return Err(CodecError::InvalidMagic(magic));
    }

    let version = reader.read_u32()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }

    let flags = reader.read_u32()?;
    let header_size = reader.read_u32()?;
    if header_size < HEADER_SIZE {
        return Err(CodecError::InvalidHeaderSize(header_size));
    }
    if header_size > HEADER_SIZE {
        // Reserved header extension
        reader.read_slice((header_size - HEADER_SIZE) as usize)?;
    }

    let constant_count = reader.read_u32()? as usize;
    // Every constant is at least one byte; cap the preallocation accordingly
    let mut constants = Vec::with_capacity(constant_count.min(reader.remaining()));
    for _ in 0..constant_count {
        let offset = reader.position();
        let tag = reader.read_u8()?;
        let constant = match tag {
            tags::NIL => Constant::Nil,
            tags::BOOL => Constant::Bool(reader.read_u8()? != 0),
            tags::NUMBER => Constant::Number(reader.read_f64()?),
            tags::STRING => Constant::String(interner.intern(reader.read_str()?)),
            tags::FUNCTION => {
                let name = interner.intern(reader.read_str()?);
                let arity = reader.read_u32()?;
                let upvalue_count = reader.read_u32()?;
                let nested = reader.read_blob()?;
                let chunk = decode_at_depth(nested, interner, depth + 1)?;
                Constant::Function(Arc::new(FunctionProto {
                    name,
                    arity,
                    upvalue_count,
                    chunk,
                }))
            }
            _ => return Err(CodecError::UnknownConstantTag { tag, offset }),
        };
        constants.push(constant);
    }

    let code = reader.read_blob()?.to_vec();

    let line_count = reader.read_u32()?;
    let lines = if line_count == 0 {
        None
    } else if line_count as usize == code.len() {
        let mut lines = Vec::with_capacity(code.len());
        for _ in 0..line_count {
            lines.push(reader.read_u32()?);
        }
        Some(lines)
    } else {
        return Err(CodecError::LineTableMismatch {
            lines: line_count,
            code: code.len(),
        });
    };

    if reader.has_more() {
        return Err(CodecError::TrailingBytes(reader.remaining()));
    }

    Ok(Chunk {
        flags,
        constants,
        code,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_chunk() -> Chunk {
        let mut inner = Chunk::new();
        inner.add_constant(Constant::Number(42.0));
        inner.write_with_line(1, 3);
        inner.write_with_line(0, 3);

        let mut chunk = Chunk::new();
        chunk.add_constant(Constant::string("hello"));
        chunk.add_constant(Constant::Function(Arc::new(FunctionProto::new(
            "add", 2, 0, inner,
        ))));
        chunk.add_constant(Constant::Bool(true));
        chunk.add_constant(Constant::Nil);
        chunk.write_with_line(7, 1);
        chunk.write_with_line(8, 2);
        chunk
    }

    #[test]
    fn test_empty_chunk_roundtrip() {
        let chunk = Chunk::new();
        let bytes = chunk.encode();
        // header + constant count + code len + line count
        assert_eq!(bytes.len(), 16 + 4 + 4 + 4);
        assert_eq!(Chunk::decode(&bytes).unwrap(), chunk);
    }

    #[test]
    fn test_header_layout() {
        let bytes = Chunk::new().encode();
        assert_eq!(&bytes[0..4], b"SWBC");
        assert_eq!(&bytes[4..8], &[0, 0, 0, 1]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 16]);
    }

    #[test]
    fn test_nested_function_roundtrip() {
        let chunk = sample_chunk();
        let decoded = Chunk::decode(&chunk.encode()).unwrap();
        assert_eq!(decoded, chunk);

        match &decoded.constants[1] {
            Constant::Function(function) => {
                assert_eq!(&*function.name, "add");
                assert_eq!(function.arity, 2);
                assert_eq!(function.chunk.constants, vec![Constant::Number(42.0)]);
                assert_eq!(function.chunk.line_at(1), Some(3));
            }
            other => panic!("Expected function constant, got {:?}", other),
        }
    }

    #[test]
    fn test_strings_are_interned_across_nesting() {
        let mut inner = Chunk::new();
        inner.add_constant(Constant::string("shared"));
        let mut chunk = Chunk::new();
        chunk.add_constant(Constant::string("shared"));
        chunk.add_constant(Constant::Function(Arc::new(FunctionProto::new("f", 0, 0, inner))));

        let decoded = Chunk::decode(&chunk.encode()).unwrap();
        let outer = match &decoded.constants[0] {
            Constant::String(s) => s.clone(),
            _ => unreachable!(),
        };
        let nested = match &decoded.constants[1] {
            Constant::Function(f) => match &f.chunk.constants[0] {
                Constant::String(s) => s.clone(),
                _ => unreachable!(),
            },
            _ => unreachable!(),
        };
        assert!(Arc::ptr_eq(&outer, &nested));
    }

    #[test]
    fn test_invalid_magic_number() {
        let mut bytes = Chunk::new().encode();
        bytes[0] = b'X';
        assert!(matches!(Chunk::decode(&bytes), Err(CodecError::InvalidMagic(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = Chunk::new().encode();
        bytes[7] = 2;
        assert_eq!(Chunk::decode(&bytes), Err(CodecError::UnsupportedVersion(2)));
    }

    #[test]
    fn test_object_tag_is_rejected() {
        let mut writer = BytecodeWriter::new();
        writer.emit_bytes(&MAGIC);
        writer.emit_u32(VERSION);
        writer.emit_u32(0);
        writer.emit_u32(HEADER_SIZE);
        writer.emit_u32(1);
        writer.emit_u8(tags::OBJECT);
        writer.emit_u32(0);
        writer.emit_u32(0);

        let err = Chunk::decode(&writer.into_bytes()).unwrap_err();
        assert_eq!(err, CodecError::UnknownConstantTag { tag: 4, offset: 20 });
    }

    #[test]
    fn test_unknown_tag_is_rejected() {
        let mut bytes = Chunk::new().encode();
        // constant count = 1, followed by a bogus tag
        bytes[16..20].copy_from_slice(&1u32.to_be_bytes());
        bytes.insert(20, 0x7F);
        assert!(matches!(
            Chunk::decode(&bytes),
            Err(CodecError::UnknownConstantTag { tag: 0x7F, .. })
        ));
    }

    #[test]
    fn test_every_truncation_fails() {
        let bytes = sample_chunk().encode();
        for len in 0..bytes.len() {
            assert!(
                Chunk::decode(&bytes[..len]).is_err(),
                "truncated to {} bytes should fail",
                len
            );
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = Chunk::new().encode();
        bytes.push(0);
        assert_eq!(Chunk::decode(&bytes), Err(CodecError::TrailingBytes(1)));
    }

    #[test]
    fn test_extended_header_is_skipped() {
        let chunk = sample_chunk();
        let bytes = chunk.encode();
        let mut extended = bytes[..12].to_vec();
        extended.extend_from_slice(&20u32.to_be_bytes());
        extended.extend_from_slice(&[0xAA; 4]);
        extended.extend_from_slice(&bytes[16..]);
        assert_eq!(Chunk::decode(&extended).unwrap(), chunk);
    }

    #[test]
    fn test_line_table_mismatch() {
        let mut chunk = Chunk::new();
        chunk.write(1);
        chunk.write(2);
        let mut bytes = chunk.encode();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&5u32.to_be_bytes());
        assert_eq!(
            Chunk::decode(&bytes),
            Err(CodecError::LineTableMismatch { lines: 1, code: 2 })
        );
    }

    #[test]
    fn test_nesting_limit() {
        let mut chunk = Chunk::new();
        for _ in 0..=MAX_NESTING_DEPTH {
            let mut outer = Chunk::new();
            outer.add_constant(Constant::Function(Arc::new(FunctionProto::new("f", 0, 0, chunk))));
            chunk = outer;
        }
        assert_eq!(chunk.nesting_depth(), MAX_NESTING_DEPTH + 1);
        assert_eq!(Chunk::decode(&chunk.encode()), Err(CodecError::NestingTooDeep));
    }

    #[test]
    fn test_deepest_accepted_nesting_roundtrips() {
        let mut chunk = Chunk::new();
        chunk.write_with_line(0, 1);
        for _ in 0..MAX_NESTING_DEPTH {
            let mut outer = Chunk::new();
            outer.add_constant(Constant::Function(Arc::new(FunctionProto::new("f", 0, 0, chunk))));
            chunk = outer;
        }
        assert_eq!(chunk.nesting_depth(), MAX_NESTING_DEPTH);
        assert_eq!(Chunk::decode(&chunk.encode()).unwrap(), chunk);
    }

    #[test]
    fn test_line_table_tracks_code() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.lines(), None);
        assert_eq!(Chunk::decode(&chunk.encode()).unwrap(), chunk);

        chunk.write(1);
        assert_eq!(chunk.lines(), None);
        chunk.write_with_line(2, 4);
        chunk.write(3);
        assert_eq!(chunk.code(), &[1, 2, 3]);
        assert_eq!(chunk.lines(), Some(&[0, 4, 0][..]));
        assert_eq!(Chunk::decode(&chunk.encode()).unwrap(), chunk);
    }

    #[test]
    fn test_write_with_line_backfills() {
        let mut chunk = Chunk::new();
        chunk.write(1);
        chunk.write_with_line(2, 9);
        assert_eq!(chunk.lines(), Some(&[0, 9][..]));
        chunk.write(3);
        assert_eq!(chunk.line_at(2), Some(0));
    }
}
