//! Shared fixtures for loader integration tests
//!
//! The mock language has one statement per line:
//!
//! ```text
//! import NAME
//! export NAME = 3.5 | "text" | true | false | nil | module.SYMBOL
//! export fn NAME -> true | false | nil | NUMBER
//! let NAME = <value>
//! fail
//! ```
//!
//! The mock compiler stores each line as a string constant; the mock engine
//! interprets them.

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use swiftlang_modules::bytecode::{Chunk, Constant};
use swiftlang_modules::{
    Compiler, Engine, ExecScope, ExecutionContext, LoaderConfig, LoaderKind, Module,
    ModuleLoader, ModuleLoaderBuilder, NativeError, NativeFunction, NativeLibrary, NativeLoader,
    Value, EXPORTS_GLOBAL,
};
use tempfile::TempDir;

/// Compiles mock source into a chunk of string constants
#[derive(Default)]
pub struct MockCompiler {
    compiles: AtomicUsize,
}

impl MockCompiler {
    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

pub fn compile(source: &str) -> Result<Chunk, String> {
    let mut chunk = Chunk::new();
    for (index, line) in source.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("//") {
            continue;
        }
        if line.starts_with('!') {
            return Err(format!("unexpected token on line {}", index + 1));
        }
        let constant = chunk.add_constant(Constant::String(Arc::from(line)));
        chunk.write_with_line(constant as u8, index as u32 + 1);
    }
    Ok(chunk)
}

impl Compiler for MockCompiler {
    fn compile(&self, source: &str, _path: &Path) -> Result<Chunk, String> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        compile(source)
    }
}

/// Creates [`MockContext`]s
#[derive(Default)]
pub struct MockEngine;

impl Engine for MockEngine {
    fn new_context(&self) -> Box<dyn ExecutionContext> {
        Box::new(MockContext::default())
    }
}

#[derive(Default)]
pub struct MockContext {
    globals: Vec<(Arc<str>, Value)>,
}

impl MockContext {
    fn global(&self, name: &str) -> Option<Value> {
        self.globals
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value.clone())
    }

    fn literal(text: &str) -> Option<Value> {
        match text {
            "true" => Some(Value::Bool(true)),
            "false" => Some(Value::Bool(false)),
            "nil" => Some(Value::Nil),
            _ if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') => {
                Some(Value::String(Arc::from(&text[1..text.len() - 1])))
            }
            _ => text.parse::<f64>().ok().map(Value::Number),
        }
    }

    fn eval(&self, text: &str, scope: &ExecScope<'_>) -> Result<Value, String> {
        if let Some(value) = Self::literal(text) {
            return Ok(value);
        }
        if let Some(value) = self.global(text) {
            return Ok(value);
        }
        let (module, symbol) = text
            .rsplit_once('.')
            .ok_or_else(|| format!("undefined variable {}", text))?;
        let module = scope.import(module)?;
        scope
            .loader()
            .get_export(&module, symbol)
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("{} has no export {}", module.path(), symbol))
    }

    fn export(&self, name: &str, value: Value) -> Result<(), String> {
        match self.global(EXPORTS_GLOBAL) {
            Some(Value::Object(exports)) => {
                exports.set(name, value);
                Ok(())
            }
            _ => Err("exports object missing".to_string()),
        }
    }

    fn statement(&mut self, line: &str, scope: &ExecScope<'_>) -> Result<(), String> {
        if line == "fail" {
            return Err("explicit failure".to_string());
        }
        if let Some(name) = line.strip_prefix("import ") {
            scope.import(name.trim())?;
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("export fn ") {
            let (name, result) = rest
                .split_once("->")
                .ok_or_else(|| format!("malformed function: {}", line))?;
            let name = name.trim();
            let result = Self::literal(result.trim())
                .ok_or_else(|| format!("bad return value: {}", line))?;
            let function = NativeFunction::new(name, move |_| Ok(result.clone()));
            return self.export(name, Value::Native(function));
        }
        if let Some(rest) = line.strip_prefix("export ") {
            let (name, expr) = rest
                .split_once('=')
                .ok_or_else(|| format!("malformed export: {}", line))?;
            let value = self.eval(expr.trim(), scope)?;
            return self.export(name.trim(), value);
        }
        if let Some(rest) = line.strip_prefix("let ") {
            let (name, expr) = rest
                .split_once('=')
                .ok_or_else(|| format!("malformed binding: {}", line))?;
            let value = self.eval(expr.trim(), scope)?;
            self.define_global(name.trim(), value);
            return Ok(());
        }
        Err(format!("unknown statement: {}", line))
    }
}

impl ExecutionContext for MockContext {
    fn define_global(&mut self, name: &str, value: Value) {
        match self.globals.iter_mut().find(|(key, _)| &**key == name) {
            Some(slot) => slot.1 = value,
            None => self.globals.push((Arc::from(name), value)),
        }
    }

    fn run(&mut self, chunk: &Chunk, scope: &ExecScope<'_>) -> Result<(), String> {
        for &index in chunk.code() {
            match chunk.constants.get(index as usize) {
                Some(Constant::String(line)) => self.statement(line, scope)?,
                other => return Err(format!("bad instruction operand: {:?}", other)),
            }
        }
        Ok(())
    }

    fn globals(&self) -> Vec<(Arc<str>, Value)> {
        self.globals.clone()
    }

    fn call(&mut self, callee: &Value, args: &[Value]) -> Result<Value, String> {
        match callee {
            Value::Native(function) => function.call(args),
            other => Err(format!("{} is not callable", other.type_name())),
        }
    }
}

/// Opens "libraries" described by a text file:
///
/// ```text
/// init SYMBOL true|false
/// fn SYMBOL OFFSET        returns OFFSET + sum of arguments
/// ```
#[derive(Default)]
pub struct MockNativeLoader {
    opened: Mutex<Vec<PathBuf>>,
}

impl MockNativeLoader {
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened.lock().clone()
    }
}

impl NativeLoader for MockNativeLoader {
    fn open(&self, path: &Path) -> Result<Box<dyn NativeLibrary>, NativeError> {
        let text = fs::read_to_string(path).map_err(|_| NativeError::NotFound {
            path: path.display().to_string(),
        })?;
        let mut library = MockLibrary {
            path: path.to_path_buf(),
            inits: HashMap::new(),
            functions: HashMap::new(),
        };
        for line in text.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            match parts.as_slice() {
                ["init", symbol, result] => {
                    library.inits.insert(symbol.to_string(), *result == "true");
                }
                ["fn", symbol, offset] => {
                    let offset = offset.parse().map_err(|_| NativeError::Platform(line.to_string()))?;
                    library.functions.insert(symbol.to_string(), offset);
                }
                _ => {}
            }
        }
        self.opened.lock().push(path.to_path_buf());
        Ok(Box::new(library))
    }
}

struct MockLibrary {
    path: PathBuf,
    inits: HashMap<String, bool>,
    functions: HashMap<String, f64>,
}

impl NativeLibrary for MockLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn has_symbol(&self, symbol: &str) -> bool {
        self.inits.contains_key(symbol) || self.functions.contains_key(symbol)
    }

    fn call_init(&self, symbol: &str, _module: &Module) -> Option<bool> {
        self.inits.get(symbol).copied()
    }

    fn function(&self, symbol: &str) -> Option<NativeFunction> {
        let offset = *self.functions.get(symbol)?;
        Some(NativeFunction::new(symbol, move |args| {
            let sum: f64 = args.iter().filter_map(Value::as_number).sum();
            Ok(Value::Number(offset + sum))
        }))
    }
}

/// A scratch project directory with an isolated loader configuration
pub struct Fixture {
    pub dir: TempDir,
    pub compiler: Arc<MockCompiler>,
    pub natives: Arc<MockNativeLoader>,
}

/// Route loader logs to the test harness; `RUST_LOG=swiftlang=debug` shows them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Fixture {
    pub fn new() -> Self {
        init_tracing();
        Self {
            dir: TempDir::new().unwrap(),
            compiler: Arc::new(MockCompiler::default()),
            natives: Arc::new(MockNativeLoader::default()),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn lib(&self) -> PathBuf {
        self.root().join("lib")
    }

    /// Config that touches nothing outside the fixture directory
    pub fn config(&self) -> LoaderConfig {
        LoaderConfig {
            search_paths: vec![self.lib()],
            use_default_search_paths: false,
            bytecode_cache: false,
            cache_dir: Some(self.root().join("bccache")),
            project_cache_dir: self.root().join(".cache"),
            user_dir: None,
            ..LoaderConfig::default()
        }
    }

    pub fn builder_with(&self, kind: LoaderKind, config: LoaderConfig) -> ModuleLoaderBuilder {
        ModuleLoader::builder(kind)
            .config(config)
            .compiler(self.compiler.clone())
            .engine(Arc::new(MockEngine))
            .native_loader(self.natives.clone())
    }

    pub fn builder(&self, kind: LoaderKind) -> ModuleLoaderBuilder {
        self.builder_with(kind, self.config())
    }

    pub fn loader(&self) -> ModuleLoader {
        self.builder(LoaderKind::Application).build()
    }

    /// Write `contents` to `lib/<relative>`
    pub fn write(&self, relative: &str, contents: &str) -> PathBuf {
        let path = self.lib().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, contents).unwrap();
        path
    }
}

/// Write a zip archive with the given entries
pub fn write_archive(path: &Path, entries: &[(&str, Vec<u8>)]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
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

/// Encoded chunk for mock source
pub fn unit(source: &str) -> Vec<u8> {
    compile(source).unwrap().encode()
}

pub fn number(value: Option<Value>) -> f64 {
    value.and_then(|v| v.as_number()).unwrap()
}
