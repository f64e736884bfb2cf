//! Runtime values stored in module scopes and exports

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use swiftlang_bytecode::{Constant, FunctionProto};

/// Signature of a host-implemented function
pub type NativeFn = dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync;

/// A callable implemented outside the bytecode engine
#[derive(Clone)]
pub struct NativeFunction {
    name: Arc<str>,
    func: Arc<NativeFn>,
}

impl NativeFunction {
    /// Wrap a closure as a native function
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            func: Arc::new(func),
        }
    }

    /// Function name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the function
    pub fn call(&self, args: &[Value]) -> Result<Value, String> {
        (self.func)(args)
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

impl PartialEq for NativeFunction {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

/// Shared, insertion-ordered property bag
///
/// Module bodies publish their exports by setting properties on the object
/// bound to `__module_exports__`.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<RwLock<Vec<(Arc<str>, Value)>>>);

impl ObjectRef {
    /// Create an empty object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a property, overwriting an existing one in place
    pub fn set(&self, name: &str, value: Value) {
        let mut properties = self.0.write();
        if let Some(slot) = properties.iter_mut().find(|(key, _)| &**key == name) {
            slot.1 = value;
        } else {
            properties.push((Arc::from(name), value));
        }
    }

    /// Read a property
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0
            .read()
            .iter()
            .find(|(key, _)| &**key == name)
            .map(|(_, value)| value.clone())
    }

    /// Snapshot of every property in insertion order
    pub fn properties(&self) -> Vec<(Arc<str>, Value)> {
        self.0.read().clone()
    }

    /// Number of properties
    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    /// Check if the object has no properties
    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.read().iter().map(|(k, v)| (k.clone(), v.clone())))
            .finish()
    }
}

impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Tagged runtime value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    Nil,
    /// Boolean
    Bool(bool),
    /// 64-bit float
    Number(f64),
    /// Immutable string
    String(Arc<str>),
    /// Bytecode function
    Function(Arc<FunctionProto>),
    /// Host function
    Native(NativeFunction),
    /// Property bag
    Object(ObjectRef),
}

impl Value {
    /// Check for nil
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Check whether the value can be called
    pub fn is_callable(&self) -> bool {
        matches!(self, Value::Function(_) | Value::Native(_))
    }

    /// Numeric payload
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Boolean payload
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// String payload
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Human-readable type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Function(_) => "function",
            Value::Native(_) => "native",
            Value::Object(_) => "object",
        }
    }
}

impl From<Constant> for Value {
    fn from(constant: Constant) -> Self {
        match constant {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(b),
            Constant::Number(n) => Value::Number(n),
            Constant::String(s) => Value::String(s),
            Constant::Function(f) => Value::Function(f),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Arc::from(s))
    }
}
