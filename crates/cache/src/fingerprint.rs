//! Call fingerprints
//!
//! A call is identified by the canonical JSON of its tagged call tree
//! (`{"type": "python_call", "callable": .., "args": [..], "kwargs": {..}}`)
//! and the SHA-224 digest of that text. Keyword arguments are sorted by name
//! before encoding; positional arguments keep their order.

use crate::registry::{Context, Registry};
use crate::value::Args;
use crate::{Error, Result};
use sha2::{Digest, Sha224};
use std::fmt;

/// Length of a digest in hex characters
pub const DIGEST_HEX_LEN: usize = 56;

const ANONYMOUS_MARKERS: [&str; 5] = ["{{closure}}", "{closure", "<lambda>", "<locals>", "{{constant}}"];

/// Stable `module:qualname` identifier of a callable
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallableRef(String);

impl CallableRef {
    /// Validate a `module:qualname` reference
    ///
    /// The module part may itself contain `::` separators; the last single
    /// `:` splits module from qualified name.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |msg: &str| Error::resolution(reference, msg);
        let (module, qualname) = reference
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected the form 'module:qualname'"))?;
        if module.is_empty() || module.ends_with(':') || qualname.is_empty() {
            return Err(invalid("expected the form 'module:qualname'"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("references cannot contain whitespace"));
        }
        if ANONYMOUS_MARKERS.iter().any(|m| reference.contains(m))
            || reference.contains(['<', '>'])
        {
            return Err(invalid("anonymous or local items have no stable name"));
        }
        Ok(Self(reference.to_string()))
    }

    /// Reference derived from the type path of a function item
    ///
    /// `my_crate::ops::download` becomes `my_crate::ops:download`. Closures
    /// and generic instantiations are rejected.
    pub fn of<F>() -> Result<Self> {
        Self::from_type_path(std::any::type_name::<F>())
    }

    /// Like [`CallableRef::of`], inferring the type from a value
    pub fn of_val<F>(_: &F) -> Result<Self> {
        Self::of::<F>()
    }

    fn from_type_path(path: &str) -> Result<Self> {
        if ANONYMOUS_MARKERS.iter().any(|m| path.contains(m)) {
            return Err(Error::resolution(
                path,
                "closures have no stable name; pass an explicit reference",
            ));
        }
        let (module, name) = path.rsplit_once("::").ok_or_else(|| {
            Error::resolution(path, "function has no module path")
        })?;
        Self::parse(&format!("{module}:{name}"))
    }

    /// The reference text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Module part
    #[must_use]
    pub fn module(&self) -> &str {
        self.0.rsplit_once(':').map_or("", |(m, _)| m)
    }

    /// Qualified name part
    #[must_use]
    pub fn qualname(&self) -> &str {
        self.0.rsplit_once(':').map_or("", |(_, q)| q)
    }
}

impl fmt::Display for CallableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical form and digest of one call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFingerprint {
    /// Compact JSON with sorted keys
    pub canonical_json: String,
    /// SHA-224 of `canonical_json`, lowercase hex
    pub digest: String,
}

/// Fingerprint a call
///
/// Fails when an argument cannot be encoded, exactly like storing that
/// argument as a result would.
pub fn fingerprint(
    registry: &Registry,
    ctx: &Context<'_>,
    callable: &CallableRef,
    args: &Args,
) -> Result<CallFingerprint> {
    let tree = registry.call_tree(callable.as_str(), args, ctx)?;
    // serde_json maps are ordered by key, so this is canonical
    let canonical_json = serde_json::to_string(&tree)?;
    let digest = hexdigest(&canonical_json);
    Ok(CallFingerprint {
        canonical_json,
        digest,
    })
}

/// SHA-224 of `text` as lowercase hex
#[must_use]
pub fn hexdigest(text: &str) -> String {
    hex::encode(Sha224::digest(text.as_bytes()))
}
