//! Integration tests for the chunk codec and module container

use std::sync::Arc;
use swiftlang_bytecode::container::{self, ExportKind};
use swiftlang_bytecode::{
    Chunk, CodecError, Constant, ContainerReader, ContainerWriter, ExportRecord, FunctionProto,
    StringInterner,
};

fn function_constant(chunk: &Chunk, index: usize) -> &FunctionProto {
    match &chunk.constants[index] {
        Constant::Function(function) => function,
        other => panic!("expected function constant, got {:?}", other),
    }
}

#[test]
fn test_hello_and_nested_function() {
    let mut inner = Chunk::new();
    inner.add_constant(Constant::Number(42.0));
    inner.write_with_line(0x01, 1);

    let mut chunk = Chunk::new();
    chunk.add_constant(Constant::string("hello"));
    chunk.add_constant(Constant::Function(Arc::new(FunctionProto::new(
        "add", 2, 0, inner,
    ))));
    chunk.write(0x02);

    let decoded = Chunk::decode(&chunk.encode()).expect("Failed to decode");

    assert_eq!(decoded.constants.len(), 2);
    assert_eq!(decoded.constants[0], Constant::string("hello"));

    let function = function_constant(&decoded, 1);
    assert_eq!(function.arity, 2);
    assert_eq!(&*function.name, "add");
    assert_eq!(function.chunk.constants.len(), 1);
    assert_eq!(function.chunk.constants[0], Constant::Number(42.0));
    assert_eq!(decoded, chunk);
}

#[test]
fn test_deeply_nested_roundtrip() {
    let mut chunk = Chunk::new();
    chunk.add_constant(Constant::Bool(true));
    for depth in 0..10u32 {
        let mut outer = Chunk::new();
        outer.add_constant(Constant::string("level"));
        outer.add_constant(Constant::Number(depth as f64));
        outer.add_constant(Constant::Function(Arc::new(FunctionProto::new(
            "inner", depth, 1, chunk,
        ))));
        outer.write_with_line(depth as u8, depth + 1);
        chunk = outer;
    }

    let decoded = Chunk::decode(&chunk.encode()).unwrap();
    assert_eq!(decoded, chunk);
}

#[test]
fn test_shared_interner_across_decodes() {
    let mut a = Chunk::new();
    a.add_constant(Constant::string("shared"));
    let mut b = Chunk::new();
    b.add_constant(Constant::string("shared"));

    let mut interner = StringInterner::new();
    let first = Chunk::decode_with(&a.encode(), &mut interner).unwrap();
    let second = Chunk::decode_with(&b.encode(), &mut interner).unwrap();

    match (&first.constants[0], &second.constants[0]) {
        (Constant::String(x), Constant::String(y)) => assert!(Arc::ptr_eq(x, y)),
        _ => panic!("expected string constants"),
    }
    assert_eq!(interner.len(), 1);
}

#[test]
fn test_nested_blob_overrun_is_rejected() {
    let mut inner = Chunk::new();
    inner.add_constant(Constant::Number(1.0));

    let mut chunk = Chunk::new();
    chunk.add_constant(Constant::Function(Arc::new(FunctionProto::new(
        "f", 0, 0, inner,
    ))));
    let mut bytes = chunk.encode();

    // header(16) + count(4) + tag(1) + name(4 + 1) + arity(4) + upvalues(4)
    let len_at = 16 + 4 + 1 + 5 + 4 + 4;
    let declared = u32::from_be_bytes(bytes[len_at..len_at + 4].try_into().unwrap());
    bytes[len_at..len_at + 4].copy_from_slice(&(declared + 100).to_be_bytes());

    assert!(matches!(Chunk::decode(&bytes), Err(CodecError::Decode(_))));
}

#[test]
fn test_container_carries_chunk() {
    let mut chunk = Chunk::new();
    chunk.add_constant(Constant::string("PI"));
    chunk.add_constant(Constant::Number(3.14159));
    chunk.write(0x10);

    let mut writer = ContainerWriter::new();
    writer.add_metadata("geometry", "0.3.1");
    writer.add_export(&ExportRecord {
        name: "PI".to_string(),
        kind: ExportKind::Constant,
        offset: 0,
        signature: String::new(),
    });
    writer.add_bytecode(&chunk.encode());
    let bytes = writer.finish(42);

    container::verify(&bytes).expect("checksum should verify");
    let reader = ContainerReader::parse(&bytes).unwrap();
    assert_eq!(reader.timestamp(), 42);
    assert_eq!(reader.name(), Some("geometry"));
    assert!(reader.find_export("PI").is_some());

    let decoded = Chunk::decode(reader.bytecode().unwrap()).unwrap();
    assert_eq!(decoded, chunk);
}

#[test]
fn test_container_file_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("geometry.swmo");

    let mut writer = ContainerWriter::new();
    writer.add_metadata("geometry", "0.3.1");
    writer.add_bytecode(&Chunk::new().encode());
    writer.write_to(&path).unwrap();

    let reader = ContainerReader::open(&path).unwrap();
    assert_eq!(reader.module_version(), Some("0.3.1"));
    assert!(reader.timestamp() > 0);

    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    std::fs::write(&path, &bytes).unwrap();
    assert!(ContainerReader::open(&path).is_err());
}
