//! Host-side value model shared by live bindings and the state codec.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::facade::FacadeRef;

/// Primitive data. Serialises as the bare JSON primitive.
///
/// A `Char` serialises as a one-character string and reads back as `Text`;
/// the state codec tags it separately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Char(char),
}

/// Engine-generated names of anonymous functions start with this.
pub const ANONYMOUS_PREFIX: &str = "anon$";

/// A script function together with the text it was compiled from.
#[derive(Debug, Clone, PartialEq)]
pub struct Closure {
    pub name: String,
    pub params: Vec<String>,
    /// Every definition of `name` (one per arity) as written, or the closure
    /// literal for an anonymous function.
    pub source: String,
    /// Values curried into the function pointer, captured variables first.
    pub captured: Vec<Value>,
}

impl Closure {
    pub fn named(name: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            source: source.into(),
            captured: Vec::new(),
        }
    }

    /// Closure literal rather than a `fn` definition.
    pub fn is_anonymous(&self) -> bool {
        self.name.starts_with(ANONYMOUS_PREFIX)
    }
}

/// A live binding value.
///
/// `Facade` and `Opaque` are context-bound or engine-internal and are never
/// persisted; the codec drops them.
#[derive(Debug, Clone)]
pub enum Value {
    Scalar(Scalar),
    Sequence(Vec<Value>),
    Mapping(BTreeMap<String, Value>),
    Closure(Closure),
    Facade(FacadeRef),
    /// An engine value with no host representation; holds the engine's type name.
    Opaque(String),
}

impl Value {
    /// The value facades and lookups return for "nothing here".
    pub fn absent() -> Self {
        Value::Scalar(Scalar::Null)
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Scalar(Scalar::Null))
    }

    pub fn text(value: impl Into<String>) -> Self {
        Value::Scalar(Scalar::Text(value.into()))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Scalar(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Scalar(Scalar::Int(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Scalar(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_facade(&self) -> Option<&FacadeRef> {
        match self {
            Value::Facade(facade) => Some(facade),
            _ => None,
        }
    }

    /// True when the value (recursively) holds only scalars, sequences and mappings.
    pub fn is_plain_data(&self) -> bool {
        match self {
            Value::Scalar(_) => true,
            Value::Sequence(items) => items.iter().all(Value::is_plain_data),
            Value::Mapping(entries) => entries.values().all(Value::is_plain_data),
            Value::Closure(_) | Value::Facade(_) | Value::Opaque(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(_) => "scalar",
            Value::Sequence(_) => "sequence",
            Value::Mapping(_) => "mapping",
            Value::Closure(_) => "closure",
            Value::Facade(_) => "facade",
            Value::Opaque(_) => "opaque",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Scalar(a), Value::Scalar(b)) => a == b,
            (Value::Sequence(a), Value::Sequence(b)) => a == b,
            (Value::Mapping(a), Value::Mapping(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => a == b,
            (Value::Facade(a), Value::Facade(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(Scalar::Null) => write!(f, "()"),
            Value::Scalar(Scalar::Bool(b)) => write!(f, "{b}"),
            Value::Scalar(Scalar::Int(n)) => write!(f, "{n}"),
            Value::Scalar(Scalar::Float(x)) => write!(f, "{x}"),
            Value::Scalar(Scalar::Text(s)) => write!(f, "{s}"),
            Value::Scalar(Scalar::Char(c)) => write!(f, "{c}"),
            Value::Sequence(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Mapping(entries) => {
                write!(f, "#{{")?;
                for (i, (key, item)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: {item}")?;
                }
                write!(f, "}}")
            }
            Value::Closure(closure) if closure.is_anonymous() => write!(f, "{}", closure.source),
            Value::Closure(closure) => write!(f, "fn {}({})", closure.name, closure.params.join(", ")),
            Value::Facade(facade) => write!(f, "{facade}"),
            Value::Opaque(type_name) => write!(f, "<{type_name}>"),
        }
    }
}

impl From<Scalar> for Value {
    fn from(value: Scalar) -> Self {
        Value::Scalar(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Scalar(Scalar::Bool(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Scalar(Scalar::Int(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Scalar(Scalar::Int(i64::from(value)))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Scalar(Scalar::Float(value))
    }
}

impl From<char> for Value {
    fn from(value: char) -> Self {
        Value::Scalar(Scalar::Char(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::text(value)
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::text(value)
    }
}

impl From<Option<String>> for Value {
    fn from(value: Option<String>) -> Self {
        value.map(Value::text).unwrap_or_else(Value::absent)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::Sequence(value)
    }
}

impl From<Vec<String>> for Value {
    fn from(value: Vec<String>) -> Self {
        Value::Sequence(value.into_iter().map(Value::text).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Mapping(value)
    }
}

impl From<FacadeRef> for Value {
    fn from(value: FacadeRef) -> Self {
        Value::Facade(value)
    }
}
