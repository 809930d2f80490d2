#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Property-based tests for call fingerprints

use callcache::{Args, CallableRef, Context, Registry, Settings, Value, fingerprint, hexdigest};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::TempDir;

fn digest_of(reference: &str, args: &Args) -> callcache::CallFingerprint {
    let tmp = TempDir::new().unwrap();
    let settings = Settings::with_cache_dir(tmp.path().join("files"));
    let blobs = settings.blob_store();
    let ctx = Context::new(&settings, &blobs);
    let registry = Registry::with_defaults();
    let callable = CallableRef::parse(reference).unwrap();
    fingerprint(&registry, &ctx, &callable, args).unwrap()
}

fn scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<i64>().prop_map(Value::Int),
        any::<bool>().prop_map(Value::Bool),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

proptest! {
    #[test]
    fn test_keyword_order_never_matters(
        kwargs in prop::collection::btree_map("[a-z_]{1,8}", scalar(), 0..6)
    ) {
        let forward = kwargs
            .iter()
            .fold(Args::new(), |args, (k, v)| args.kwarg(k.clone(), v.clone()));
        let backward = kwargs
            .iter()
            .rev()
            .fold(Args::new(), |args, (k, v)| args.kwarg(k.clone(), v.clone()));

        let a = digest_of("demo.math:combine", &forward);
        let b = digest_of("demo.math:combine", &backward);
        prop_assert_eq!(a, b);
    }

    #[test]
    fn test_positional_order_matters(x in any::<i64>(), y in any::<i64>()) {
        prop_assume!(x != y);
        let a = digest_of("demo.math:combine", &Args::new().arg(x).arg(y));
        let b = digest_of("demo.math:combine", &Args::new().arg(y).arg(x));
        prop_assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_digest_is_sha224_of_canonical_json(
        positional in prop::collection::vec(scalar(), 0..4),
        kwargs in prop::collection::btree_map("[a-z]{1,6}", scalar(), 0..4)
    ) {
        let args = Args {
            positional,
            keyword: kwargs.into_iter().collect::<BTreeMap<_, _>>(),
        };
        let fp = digest_of("demo.math:combine", &args);

        prop_assert_eq!(fp.digest.len(), 56);
        prop_assert!(fp.digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        prop_assert_eq!(&fp.digest, &hexdigest(&fp.canonical_json));

        // Re-serializing the canonical form is a fixed point
        let parsed: serde_json::Value = serde_json::from_str(&fp.canonical_json).unwrap();
        prop_assert_eq!(serde_json::to_string(&parsed).unwrap(), fp.canonical_json);
    }

    #[test]
    fn test_callable_is_part_of_the_digest(x in any::<i64>()) {
        let args = Args::new().arg(x);
        let a = digest_of("demo.math:square", &args);
        let b = digest_of("demo.math:cube", &args);
        prop_assert_ne!(a.digest, b.digest);
    }
}
