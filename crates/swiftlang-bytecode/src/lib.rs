//! Swiftlang Bytecode Format
//!
//! This crate provides the serialized form of a compiled code unit (`Chunk`),
//! the big-endian reader/writer primitives it is built on, and the `SWMO`
//! container used to persist compiled modules.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod chunk;
pub mod container;
pub mod encoder;
pub mod interner;

pub use chunk::{Chunk, CodecError, Constant, FunctionProto};
pub use container::{
    ContainerError, ContainerReader, ContainerWriter, ExportKind, ExportRecord, ImportRecord,
    NativeBinding, SectionEntry, SectionKind,
};
pub use encoder::{BytecodeReader, BytecodeWriter, DecodeError};
pub use interner::StringInterner;
