//! Serialization registry
//!
//! Turns [`Value`]s into JSON-safe tagged trees and back. JSON-native values
//! pass through unchanged; everything else goes through an ordered table of
//! `(TypeKey, encoder)` pairs scanned from the most recently registered
//! entry backwards. Decoding resolves two tagged shapes through an explicit
//! symbol table:
//!
//! ```json
//! {"type": "python_object", "reference": "module:qualname"}
//! {"type": "python_call", "callable": "module:qualname", "args": [..], "kwargs": {..}}
//! ```
//!
//! The tag names are shared with stores written by earlier releases.

pub mod builtin;
pub mod files;

use crate::config::Settings;
use crate::fingerprint::CallableRef;
use crate::value::{Args, CallFn, Callable, Value};
use crate::{Error, Result};
use callcache_cas::BlobStore;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

/// Discriminator key of a tagged node
pub const TYPE_KEY: &str = "type";
/// Tag of a reference to a registered symbol
pub const OBJECT_TAG: &str = "python_object";
/// Tag of a reconstruction call
pub const CALL_TAG: &str = "python_call";
/// Key holding the symbol of an object node
pub const REFERENCE_KEY: &str = "reference";
/// Older spelling of [`REFERENCE_KEY`], still accepted when decoding
pub const LEGACY_REFERENCE_KEY: &str = "fully_qualified_name";

/// Encoder function stored in the dispatch table
pub type EncodeFn =
    Arc<dyn Fn(&Registry, &Value, &Context<'_>) -> Result<serde_json::Value> + Send + Sync>;

/// What encoders and reconstruction calls may touch
#[derive(Debug, Clone, Copy)]
pub struct Context<'a> {
    /// Active settings
    pub settings: &'a Settings,
    /// Blob store for file-backed values
    pub blobs: &'a BlobStore,
}

impl<'a> Context<'a> {
    /// Bundle settings and blob store
    #[must_use]
    pub fn new(settings: &'a Settings, blobs: &'a BlobStore) -> Self {
        Self { settings, blobs }
    }
}

/// Runtime type descriptor used to select encoders
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeKey {
    /// Every value
    Any,
    /// [`Value::Callable`]
    Callable,
    /// [`Value::Bytes`]
    Bytes,
    /// [`Value::Date`]
    Date,
    /// [`Value::DateTime`]
    DateTime,
    /// [`Value::Duration`]
    Duration,
    /// [`Value::File`]
    File,
    /// [`Value::Array`]
    Array,
    /// [`Value::Object`] whose [`crate::value::Opaque::type_name`] matches
    Object(String),
}

impl TypeKey {
    /// Whether an encoder registered for this key applies to `value`
    #[must_use]
    pub fn matches(&self, value: &Value) -> bool {
        match (self, value) {
            (Self::Any, _)
            | (Self::Callable, Value::Callable(_))
            | (Self::Bytes, Value::Bytes(_))
            | (Self::Date, Value::Date(_))
            | (Self::DateTime, Value::DateTime(_))
            | (Self::Duration, Value::Duration(_))
            | (Self::File, Value::File(_))
            | (Self::Array, Value::Array(_)) => true,
            (Self::Object(name), Value::Object(obj)) => obj.type_name() == name,
            _ => false,
        }
    }
}

/// Encoder table plus symbol table
pub struct Registry {
    encoders: RwLock<Vec<(TypeKey, EncodeFn)>>,
    symbols: RwLock<HashMap<String, CallFn>>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let encoders: Vec<TypeKey> = self.encoders.read().iter().map(|(k, _)| k.clone()).collect();
        let mut symbols: Vec<String> = self.symbols.read().keys().cloned().collect();
        symbols.sort();
        f.debug_struct("Registry")
            .field("encoders", &encoders)
            .field("symbols", &symbols)
            .finish()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl Registry {
    /// A registry with no encoders and no symbols
    #[must_use]
    pub fn empty() -> Self {
        Self {
            encoders: RwLock::new(Vec::new()),
            symbols: RwLock::new(HashMap::new()),
        }
    }

    /// A registry with the built-in encoders and their reconstruction symbols
    ///
    /// Registration order: generic objects, callables, bytes, dates,
    /// timestamps, durations, files, arrays.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::empty();
        builtin::register(&registry);
        files::register(&registry);
        registry
    }

    /// Append an encoder; it takes precedence over every earlier one
    pub fn register_encoder<F>(&self, key: TypeKey, encoder: F)
    where
        F: Fn(&Self, &Value, &Context<'_>) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        self.encoders.write().push((key, Arc::new(encoder)));
    }

    /// Make a function resolvable under a stable `module:qualname` identifier
    pub fn register_function<F>(&self, reference: &str, func: F) -> Result<()>
    where
        F: Fn(&Context<'_>, &Args) -> Result<Value> + Send + Sync + 'static,
    {
        let reference = CallableRef::parse(reference)?;
        self.symbols
            .write()
            .insert(reference.as_str().to_string(), Arc::new(func));
        Ok(())
    }

    /// Look up a registered function
    pub fn resolve(&self, reference: &str) -> Result<Callable> {
        let reference = CallableRef::parse(reference)?;
        let func = self
            .symbols
            .read()
            .get(reference.as_str())
            .cloned()
            .ok_or_else(|| Error::resolution(reference.as_str(), "no such registered function"))?;
        Ok(Callable::new(reference.as_str(), func))
    }

    /// Whether a function is registered under `reference`
    #[must_use]
    pub fn is_registered(&self, reference: &str) -> bool {
        self.symbols.read().contains_key(reference)
    }

    /// Encode a value into a JSON-safe tagged tree
    pub fn encode(&self, value: &Value, ctx: &Context<'_>) -> Result<serde_json::Value> {
        match value {
            Value::List(items) => {
                return items
                    .iter()
                    .map(|item| self.encode(item, ctx))
                    .collect::<Result<Vec<_>>>()
                    .map(serde_json::Value::Array);
            }
            Value::Map(map) => {
                return map
                    .iter()
                    .map(|(k, v)| self.encode(v, ctx).map(|v| (k.clone(), v)))
                    .collect::<Result<serde_json::Map<_, _>>>()
                    .map(serde_json::Value::Object);
            }
            _ => {}
        }
        if let Some(json) = value.to_json() {
            return Ok(json);
        }

        // Snapshot candidates so encoders may recurse into the registry
        let candidates: Vec<EncodeFn> = self
            .encoders
            .read()
            .iter()
            .rev()
            .filter(|(key, _)| key.matches(value))
            .map(|(_, encoder)| Arc::clone(encoder))
            .collect();

        let strict = ctx.settings.raise_all_encoding_errors;
        let mut last_failure = None;
        for encoder in candidates {
            match encoder(self, value, ctx) {
                Ok(tree) => return Ok(tree),
                Err(e) if strict || e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(value_type = value.type_name(), "Encoder did not work: {e}");
                    last_failure = Some(e.to_string());
                }
            }
        }
        Err(Error::encode(
            value.type_name(),
            last_failure.unwrap_or_else(|| "no encoder registered for this type".to_string()),
        ))
    }

    /// Tagged tree of a call to `callable` with `args`
    ///
    /// Empty positional or keyword arguments are omitted.
    pub fn call_tree(
        &self,
        callable: &str,
        args: &Args,
        ctx: &Context<'_>,
    ) -> Result<serde_json::Value> {
        let callable = CallableRef::parse(callable)?;
        let mut node = serde_json::Map::new();
        node.insert(TYPE_KEY.into(), CALL_TAG.into());
        node.insert("callable".into(), callable.as_str().into());
        if !args.positional.is_empty() {
            let encoded = args
                .positional
                .iter()
                .map(|v| self.encode(v, ctx))
                .collect::<Result<Vec<_>>>()?;
            node.insert("args".into(), serde_json::Value::Array(encoded));
        }
        if !args.keyword.is_empty() {
            let encoded = args
                .keyword
                .iter()
                .map(|(k, v)| self.encode(v, ctx).map(|v| (k.clone(), v)))
                .collect::<Result<serde_json::Map<_, _>>>()?;
            node.insert("kwargs".into(), serde_json::Value::Object(encoded));
        }
        Ok(serde_json::Value::Object(node))
    }

    /// Decode a tagged tree, innermost nodes first
    pub fn decode(&self, tree: &serde_json::Value, ctx: &Context<'_>) -> Result<Value> {
        match tree {
            serde_json::Value::Array(items) => items
                .iter()
                .map(|item| self.decode(item, ctx))
                .collect::<Result<Vec<_>>>()
                .map(Value::List),
            serde_json::Value::Object(map) => {
                let mut node = BTreeMap::new();
                for (key, child) in map {
                    node.insert(key.clone(), self.decode(child, ctx)?);
                }
                self.decode_node(node, ctx)
            }
            other => Ok(Value::from_json(other)),
        }
    }

    fn decode_node(&self, node: BTreeMap<String, Value>, ctx: &Context<'_>) -> Result<Value> {
        match node.get(TYPE_KEY).and_then(Value::as_str) {
            Some(OBJECT_TAG) => {
                let reference = node
                    .get(REFERENCE_KEY)
                    .or_else(|| node.get(LEGACY_REFERENCE_KEY))
                    .and_then(Value::as_str);
                if let Some(reference) = reference {
                    return self.resolve(reference).map(Value::Callable);
                }
            }
            Some(CALL_TAG) => {
                if let Some(target) = node.get("callable") {
                    return self.decode_call(target, &node, ctx);
                }
            }
            _ => {}
        }
        Ok(Value::Map(node))
    }

    fn decode_call(
        &self,
        target: &Value,
        node: &BTreeMap<String, Value>,
        ctx: &Context<'_>,
    ) -> Result<Value> {
        let callable = match target {
            Value::String(reference) => self.resolve(reference)?,
            Value::Callable(callable) => callable.clone(),
            other => {
                return Err(Error::resolution(
                    other.type_name(),
                    "callable must be a reference string",
                ));
            }
        };
        let positional = match node.get("args") {
            None => Vec::new(),
            Some(Value::List(items)) => items.clone(),
            Some(other) => {
                return Err(Error::decode(format!(
                    "args of {} must be a list, got {}",
                    callable.reference,
                    other.type_name()
                )));
            }
        };
        let keyword = match node.get("kwargs") {
            None => BTreeMap::new(),
            Some(Value::Map(map)) => map.clone(),
            Some(other) => {
                return Err(Error::decode(format!(
                    "kwargs of {} must be a map, got {}",
                    callable.reference,
                    other.type_name()
                )));
            }
        };
        let args = Args {
            positional,
            keyword,
        };
        callable.call(ctx, &args).map_err(|e| match e {
            e @ (Error::Blob(_) | Error::Resolution { .. } | Error::Decode { .. }) => e,
            other => Error::decode(format!("{} failed: {other}", callable.reference)),
        })
    }
}

/// Positional string argument of a reconstruction call
pub(crate) fn str_arg<'a>(args: &'a Args, index: usize, what: &str) -> Result<&'a str> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::decode(format!("argument {index} ({what}) must be a string")))
}

/// Positional integer argument of a reconstruction call
pub(crate) fn int_arg(args: &Args, index: usize, what: &str) -> Result<i64> {
    args.get(index)
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::decode(format!("argument {index} ({what}) must be an integer")))
}
