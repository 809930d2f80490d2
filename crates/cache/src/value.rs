//! Runtime values passed to and returned from cached functions
//!
//! [`Value`] covers the JSON data model plus the richer kinds the
//! serialization registry knows how to store: bytes, timestamps, durations,
//! registered functions, files, arrays and application-defined objects.

use crate::registry::Context;
use crate::{Error, Result};
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Function pointer stored in the symbol table
pub type CallFn = Arc<dyn Fn(&Context<'_>, &Args) -> Result<Value> + Send + Sync>;

/// Arguments of a call: positional values and keyword values
///
/// Keywords are held sorted, so their order never matters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Args {
    /// Positional arguments, order significant
    pub positional: Vec<Value>,
    /// Keyword arguments, sorted by name
    pub keyword: BTreeMap<String, Value>,
}

impl Args {
    /// No arguments
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument
    #[must_use]
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Set a keyword argument
    #[must_use]
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.keyword.insert(name.into(), value.into());
        self
    }

    /// Positional argument `index`, if present
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// Keyword argument `name`, if present
    #[must_use]
    pub fn get_kw(&self, name: &str) -> Option<&Value> {
        self.keyword.get(name)
    }

    /// True when there are neither positional nor keyword arguments
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }
}

/// A call that rebuilds an opaque object when a cached result is decoded
#[derive(Debug, Clone, PartialEq)]
pub struct Reconstruction {
    /// Registered `module:qualname` of the constructor
    pub callable: String,
    /// Arguments passed to the constructor
    pub args: Args,
}

/// Application-defined values the cache cannot inspect
///
/// An opaque value is stored as the call that rebuilds it. Types without a
/// reconstruction can only be stored by an encoder registered for their
/// [`Opaque::type_name`].
pub trait Opaque: fmt::Debug + Send + Sync {
    /// Stable name of the concrete type, used for encoder dispatch
    fn type_name(&self) -> &str;

    /// Downcasting support
    fn as_any(&self) -> &dyn Any;

    /// The registered call that rebuilds this value
    fn reconstruction(&self) -> Option<Reconstruction> {
        None
    }
}

/// A registered function carried as a value
#[derive(Clone)]
pub struct Callable {
    /// Registered `module:qualname`
    pub reference: String,
    func: CallFn,
}

impl Callable {
    /// Pair a reference with its function pointer
    #[must_use]
    pub fn new(reference: impl Into<String>, func: CallFn) -> Self {
        Self {
            reference: reference.into(),
            func,
        }
    }

    /// Invoke the function
    pub fn call(&self, ctx: &Context<'_>, args: &Args) -> Result<Value> {
        (self.func)(ctx, args)
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callable").field(&self.reference).finish()
    }
}

/// A file or directory store on disk
///
/// Returned by cached functions that produce files; after a round trip the
/// path points at the verified blob inside the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedFile {
    /// Location on the local filesystem
    pub path: PathBuf,
    /// Options a reader should use to open the file (mode, encoding, ...)
    pub open_options: BTreeMap<String, Value>,
}

impl CachedFile {
    /// A file with no open options
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            open_options: BTreeMap::new(),
        }
    }

    /// Add an open option
    #[must_use]
    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.open_options.insert(name.into(), value.into());
        self
    }
}

/// Dense n-dimensional array of `f64` in row-major order
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    shape: Vec<usize>,
    data: Vec<f64>,
}

impl NdArray {
    /// Build an array, checking that `data` fills `shape`
    pub fn new(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::validation(format!(
                "shape {shape:?} needs {expected} elements, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// Dimensions
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Elements in row-major order
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }
}

/// A runtime value
#[derive(Debug, Clone)]
pub enum Value {
    /// JSON null
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// UTF-8 string
    String(String),
    /// Ordered list
    List(Vec<Value>),
    /// String-keyed map
    Map(BTreeMap<String, Value>),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Timestamp in UTC
    DateTime(DateTime<Utc>),
    /// Calendar date
    Date(NaiveDate),
    /// Signed duration
    Duration(TimeDelta),
    /// Registered function
    Callable(Callable),
    /// File or directory store on disk
    File(CachedFile),
    /// Numeric array
    Array(NdArray),
    /// Application-defined object
    Object(Arc<dyn Opaque>),
}

impl Value {
    /// Short name of the variant, used in diagnostics
    #[must_use]
    pub fn type_name(&self) -> &str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Map(_) => "map",
            Self::Bytes(_) => "bytes",
            Self::DateTime(_) => "datetime",
            Self::Date(_) => "date",
            Self::Duration(_) => "duration",
            Self::Callable(_) => "callable",
            Self::File(_) => "file",
            Self::Array(_) => "array",
            Self::Object(o) => o.type_name(),
        }
    }

    /// Convert a JSON tree without interpreting tags
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or(f64::NAN)), Self::Int),
            serde_json::Value::String(s) => Self::String(s.clone()),
            serde_json::Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
            serde_json::Value::Object(map) => Self::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Self::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// The JSON form of a JSON-native value
    ///
    /// Returns `None` as soon as any nested value needs an encoder.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Self::Null => serde_json::Value::Null,
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f).map(serde_json::Value::Number)?,
            Self::String(s) => serde_json::Value::String(s.clone()),
            Self::List(items) => serde_json::Value::Array(
                items.iter().map(Self::to_json).collect::<Option<Vec<_>>>()?,
            ),
            Self::Map(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<serde_json::Map<_, _>>>()?,
            ),
            _ => return None,
        })
    }

    /// String content, if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Map content, if this is a map
    #[must_use]
    pub fn as_map(&self) -> Option<&BTreeMap<String, Self>> {
        match self {
            Self::Map(m) => Some(m),
            _ => None,
        }
    }

    /// File content, if this is a file
    #[must_use]
    pub fn as_file(&self) -> Option<&CachedFile> {
        match self {
            Self::File(f) => Some(f),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::String(a), Self::String(b)) => a == b,
            (Self::List(a), Self::List(b)) => a == b,
            (Self::Map(a), Self::Map(b)) => a == b,
            (Self::Bytes(a), Self::Bytes(b)) => a == b,
            (Self::DateTime(a), Self::DateTime(b)) => a == b,
            (Self::Date(a), Self::Date(b)) => a == b,
            (Self::Duration(a), Self::Duration(b)) => a == b,
            (Self::Callable(a), Self::Callable(b)) => a.reference == b.reference,
            (Self::File(a), Self::File(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.type_name() == b.type_name()
                        && a.reconstruction().is_some()
                        && a.reconstruction() == b.reconstruction())
            }
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Self::DateTime(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<TimeDelta> for Value {
    fn from(v: TimeDelta) -> Self {
        Self::Duration(v)
    }
}

impl From<CachedFile> for Value {
    fn from(v: CachedFile) -> Self {
        Self::File(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Self::Array(v)
    }
}

impl From<Vec<Self>> for Value {
    fn from(v: Vec<Self>) -> Self {
        Self::List(v)
    }
}

impl From<BTreeMap<String, Self>> for Value {
    fn from(v: BTreeMap<String, Self>) -> Self {
        Self::Map(v)
    }
}
