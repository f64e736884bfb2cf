//! Byte-level encoding and decoding utilities
//!
//! Chunks are written big-endian; the module container is written
//! little-endian. Both go through the same writer/reader pair, parameterised
//! by [`ByteOrder`].

use thiserror::Error;

/// Errors that can occur during low-level decoding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Unexpected end of the byte stream
    #[error("Unexpected end of bytecode at offset {0}")]
    UnexpectedEnd(usize),

    /// Invalid UTF-8 string
    #[error("Invalid UTF-8 string at offset {0}")]
    InvalidUtf8(usize),
}

/// Byte order used for multi-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first (chunk format)
    Big,
    /// Least significant byte first (container format)
    Little,
}

/// Bytecode writer
///
/// Appends primitive values to a growable buffer.
pub struct BytecodeWriter {
    /// Internal buffer containing the encoded bytes
    pub(crate) buffer: Vec<u8>,
    order: ByteOrder,
}

impl BytecodeWriter {
    /// Create a new big-endian writer
    pub fn new() -> Self {
        Self::with_order(ByteOrder::Big)
    }

    /// Create a new writer with an explicit byte order
    pub fn with_order(order: ByteOrder) -> Self {
        Self {
            buffer: Vec::new(),
            order,
        }
    }

    /// Create a new big-endian writer with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            order: ByteOrder::Big,
        }
    }

    /// Get the current buffer
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Consume the writer and return the buffer
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get the current offset (length of the buffer)
    pub fn offset(&self) -> usize {
        self.buffer.len()
    }

    // ===== Basic Emission =====

    /// Emit a raw byte
    pub fn emit_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    /// Emit a 32-bit unsigned integer
    pub fn emit_u32(&mut self, value: u32) {
        match self.order {
            ByteOrder::Big => self.buffer.extend_from_slice(&value.to_be_bytes()),
            ByteOrder::Little => self.buffer.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Emit a 64-bit unsigned integer
    pub fn emit_u64(&mut self, value: u64) {
        match self.order {
            ByteOrder::Big => self.buffer.extend_from_slice(&value.to_be_bytes()),
            ByteOrder::Little => self.buffer.extend_from_slice(&value.to_le_bytes()),
        }
    }

    /// Emit a 64-bit float as its IEEE-754 bit pattern
    pub fn emit_f64(&mut self, value: f64) {
        self.emit_u64(value.to_bits());
    }

    /// Emit raw bytes without a length prefix
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a length-prefixed byte blob (u32 length + bytes)
    pub fn emit_blob(&mut self, bytes: &[u8]) {
        self.emit_u32(bytes.len() as u32);
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit a length-prefixed string (u32 length + UTF-8 bytes)
    pub fn emit_string(&mut self, value: &str) {
        self.emit_blob(value.as_bytes());
    }

    /// Overwrite a previously emitted u32 at `offset`
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        let bytes = match self.order {
            ByteOrder::Big => value.to_be_bytes(),
            ByteOrder::Little => value.to_le_bytes(),
        };
        self.buffer[offset..offset + 4].copy_from_slice(&bytes);
    }
}

impl Default for BytecodeWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytecode reader
///
/// Every read is bounds-checked against the underlying slice; running past
/// the end yields [`DecodeError::UnexpectedEnd`].
pub struct BytecodeReader<'a> {
    buffer: &'a [u8],
    position: usize,
    order: ByteOrder,
}

impl<'a> BytecodeReader<'a> {
    /// Create a new big-endian reader
    pub fn new(buffer: &'a [u8]) -> Self {
        Self::with_order(buffer, ByteOrder::Big)
    }

    /// Create a new reader with an explicit byte order
    pub fn with_order(buffer: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buffer,
            position: 0,
            order,
        }
    }

    /// Get the current position in the buffer
    pub fn position(&self) -> usize {
        self.position
    }

    /// Get the remaining bytes in the buffer
    pub fn remaining(&self) -> usize {
        self.buffer.len().saturating_sub(self.position)
    }

    /// Check if there are more bytes to read
    pub fn has_more(&self) -> bool {
        self.position < self.buffer.len()
    }

    /// Seek to a specific position
    ///
    /// Seeking past the end is allowed; the next read fails.
    pub fn seek(&mut self, position: usize) {
        self.position = position;
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .position
            .checked_add(count)
            .ok_or(DecodeError::UnexpectedEnd(self.position))?;
        if end > self.buffer.len() {
            return Err(DecodeError::UnexpectedEnd(self.position));
        }
        let bytes = &self.buffer[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    // ===== Basic Reading =====

    /// Read a single byte
    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    /// Read a 32-bit unsigned integer
    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(self.take(4)?);
        Ok(match self.order {
            ByteOrder::Big => u32::from_be_bytes(bytes),
            ByteOrder::Little => u32::from_le_bytes(bytes),
        })
    }

    /// Read a 64-bit unsigned integer
    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(match self.order {
            ByteOrder::Big => u64::from_be_bytes(bytes),
            ByteOrder::Little => u64::from_le_bytes(bytes),
        })
    }

    /// Read a 64-bit float from its IEEE-754 bit pattern
    pub fn read_f64(&mut self) -> Result<f64, DecodeError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Borrow a fixed number of bytes
    pub fn read_slice(&mut self, count: usize) -> Result<&'a [u8], DecodeError> {
        self.take(count)
    }

    /// Read a fixed number of bytes
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>, DecodeError> {
        Ok(self.take(count)?.to_vec())
    }

    /// Borrow a length-prefixed byte blob (u32 length + bytes)
    pub fn read_blob(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Borrow a length-prefixed UTF-8 string
    pub fn read_str(&mut self) -> Result<&'a str, DecodeError> {
        let start = self.position;
        let bytes = self.read_blob()?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8(start + 4))
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String, DecodeError> {
        self.read_str().map(str::to_owned)
    }
}

#[cfg(test)]
#[allow(clippy::approx_constant)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut writer = BytecodeWriter::new();
        writer.emit_u32(0x0102_0304);
        assert_eq!(writer.buffer(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_little_endian_layout() {
        let mut writer = BytecodeWriter::with_order(ByteOrder::Little);
        writer.emit_u32(0x0102_0304);
        assert_eq!(writer.buffer(), &[4, 3, 2, 1]);
    }

    #[test]
    fn test_reader_primitives() {
        let mut writer = BytecodeWriter::new();
        writer.emit_u8(0x42);
        writer.emit_u32(0xABCD_EF01);
        writer.emit_u64(0x0102_0304_0506_0708);
        writer.emit_f64(3.14159);

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);

        assert_eq!(reader.read_u8().unwrap(), 0x42);
        assert_eq!(reader.read_u32().unwrap(), 0xABCD_EF01);
        assert_eq!(reader.read_u64().unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(reader.read_f64().unwrap(), 3.14159);
        assert!(!reader.has_more());
    }

    #[test]
    fn test_reader_bounds_checking() {
        let bytes = vec![0x01, 0x02];
        let mut reader = BytecodeReader::new(&bytes);

        assert_eq!(reader.read_u8().unwrap(), 0x01);
        assert_eq!(reader.read_u32(), Err(DecodeError::UnexpectedEnd(1)));
        // A failed read does not advance
        assert_eq!(reader.position(), 1);
    }

    #[test]
    fn test_reader_string() {
        let mut writer = BytecodeWriter::new();
        writer.emit_string("hello");

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);
        assert_eq!(reader.read_string().unwrap(), "hello");
    }

    #[test]
    fn test_reader_string_length_past_end() {
        let mut writer = BytecodeWriter::new();
        writer.emit_u32(100);
        writer.emit_bytes(b"abc");

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);
        assert!(matches!(reader.read_string(), Err(DecodeError::UnexpectedEnd(_))));
    }

    #[test]
    fn test_reader_invalid_utf8() {
        let mut writer = BytecodeWriter::new();
        writer.emit_blob(&[0xFF, 0xFE]);

        let bytes = writer.into_bytes();
        let mut reader = BytecodeReader::new(&bytes);
        assert_eq!(reader.read_string(), Err(DecodeError::InvalidUtf8(4)));
    }

    #[test]
    fn test_patch_u32() {
        let mut writer = BytecodeWriter::with_order(ByteOrder::Little);
        writer.emit_u32(0);
        writer.emit_u8(9);
        writer.patch_u32(0, 7);
        assert_eq!(writer.buffer(), &[7, 0, 0, 0, 9]);
    }

    #[test]
    fn test_reader_seek_past_end() {
        let bytes = vec![0x01, 0x02, 0x03, 0x04];
        let mut reader = BytecodeReader::new(&bytes);

        reader.seek(3);
        assert_eq!(reader.read_u8().unwrap(), 0x04);
        reader.seek(usize::MAX);
        assert!(reader.read_u8().is_err());
        assert_eq!(reader.remaining(), 0);
    }
}
