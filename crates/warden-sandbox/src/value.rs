//! Runtime values of the interpreter

use crate::bytecode::Constant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    Object(Arc<Object>),
    Exception(Arc<Exception>),
}

impl Value {
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Object(_) => "object",
            Value::Exception(_) => "exception",
        }
    }

    /// Value identity for `eq` / `ne`: primitives by value, references by pointer
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Exception(a), Value::Exception(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Str(s) => serde_json::Value::String(s.to_string()),
            Value::Object(_) | Value::Exception(_) => serde_json::Value::String(self.to_string()),
        }
    }
}

impl From<&Constant> for Value {
    fn from(constant: &Constant) -> Self {
        match constant {
            Constant::Null => Value::Null,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Str(s) => Value::str(s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{}", s),
            Value::Object(object) => write!(f, "{}@{}", object.class, object.id),
            Value::Exception(exception) => write!(f, "{}", exception),
        }
    }
}

/// Heap object created by `new`
#[derive(Debug)]
pub struct Object {
    pub id: u64,
    pub class: String,
    fields: Mutex<BTreeMap<String, Value>>,
}

impl Object {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            class: class.into(),
            fields: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn get(&self, field: &str) -> Value {
        let fields = self.fields.lock().unwrap_or_else(|e| e.into_inner());
        fields.get(field).cloned().unwrap_or(Value::Null)
    }

    pub fn set(&self, field: &str, value: Value) {
        let mut fields = self.fields.lock().unwrap_or_else(|e| e.into_inner());
        fields.insert(field.to_string(), value);
    }
}

/// A thrown error. `uncatchable` exceptions pass every handler of
/// untrusted code and surface at the task boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exception {
    pub kind: String,
    pub message: String,
    #[serde(skip)]
    pub uncatchable: bool,
}

impl Exception {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            uncatchable: false,
        }
    }

    pub fn uncatchable(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            uncatchable: true,
            ..Self::new(kind, message)
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}
