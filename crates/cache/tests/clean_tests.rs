#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Eviction, unknown-file sweeps and expiration maintenance

mod support;

use callcache::{
    Args, CacheEngine, CachedFile, CleanOptions, EntryQuery, Error, EvictionMethod,
    ExpireOptions, Expiration, MemoryStore, MetadataStore, NdArray, Settings, Value,
    clean_cache_files, clean_invalid_cache_entries, expire_cache_entries, file_assets,
};
use callcache_cas::DIRECTORY_STORE_KIND;
use chrono::{TimeDelta, Utc};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use support::{capture_events, engine_with, write_file};
use tempfile::TempDir;

/// Every payload written by [`cache_payload`] has this many bytes
const PAYLOAD_SIZE: u64 = 11;

fn setup() -> (TempDir, CacheEngine, Arc<MemoryStore>) {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(&tmp, store.clone());
    (tmp, engine, store)
}

/// Cache a call returning a file with content `payload-<i>`; returns the blob path
fn cache_payload(engine: &CacheEngine, tmp: &TempDir, reference: &str, i: i64) -> PathBuf {
    let src = tmp.path().join("src");
    let produce = move |args: &Args| -> callcache::Result<Value> {
        let i = args.get(0).and_then(Value::as_i64).unwrap_or_default();
        let path = write_file(&src, &format!("in-{i}.txt"), format!("payload-{i:03}").as_bytes());
        Ok(Value::File(CachedFile::new(path)))
    };
    let value = engine
        .cacheable(reference, produce)
        .unwrap()
        .call(&Args::new().arg(i))
        .unwrap();
    value.as_file().unwrap().path.clone()
}

fn blob_contents(root: &Path) -> BTreeSet<String> {
    fs::read_dir(root)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.is_file())
        .map(|p| fs::read_to_string(p).unwrap())
        .collect()
}

fn usage(engine: &CacheEngine) -> u64 {
    engine.blobs().disk_usage(1).unwrap().values().sum()
}

fn entry_count(store: &dyn MetadataStore) -> usize {
    store.query(&EntryQuery::default()).unwrap().len()
}

// ============================================================================
// Eviction order
// ============================================================================

/// Entry 0 is used often but long ago; entries 1 and 2 are recent but used once
fn seed_three(engine: &CacheEngine, tmp: &TempDir) {
    cache_payload(engine, tmp, "pipeline.io:payload", 0);
    cache_payload(engine, tmp, "pipeline.io:payload", 0);
    cache_payload(engine, tmp, "pipeline.io:payload", 0);
    cache_payload(engine, tmp, "pipeline.io:payload", 1);
    cache_payload(engine, tmp, "pipeline.io:payload", 2);
}

#[test]
fn test_lru_removes_least_recently_updated() {
    let (tmp, engine, store) = setup();
    seed_three(&engine, &tmp);
    assert_eq!(usage(&engine), 3 * PAYLOAD_SIZE);

    let report = clean_cache_files(&engine, &CleanOptions::new(2 * PAYLOAD_SIZE)).unwrap();

    assert_eq!(report.entries_deleted, 1);
    assert_eq!(report.files_deleted, 1);
    assert_eq!(report.bytes_freed, PAYLOAD_SIZE);
    assert_eq!(report.final_usage, 2 * PAYLOAD_SIZE);
    assert!(usage(&engine) <= 2 * PAYLOAD_SIZE);
    assert_eq!(entry_count(store.as_ref()), 2);
    assert_eq!(
        blob_contents(engine.blobs().root()),
        BTreeSet::from(["payload-001".to_string(), "payload-002".to_string()])
    );
}

#[test]
fn test_lfu_removes_lowest_counter() {
    let (tmp, engine, store) = setup();
    seed_three(&engine, &tmp);

    let options = CleanOptions {
        method: EvictionMethod::Lfu,
        ..CleanOptions::new(2 * PAYLOAD_SIZE)
    };
    let report = clean_cache_files(&engine, &options).unwrap();

    assert_eq!(report.entries_deleted, 1);
    assert_eq!(entry_count(store.as_ref()), 2);
    assert_eq!(
        blob_contents(engine.blobs().root()),
        BTreeSet::from(["payload-000".to_string(), "payload-002".to_string()])
    );
}

#[test]
fn test_nothing_happens_under_maxsize() {
    let (tmp, engine, store) = setup();
    seed_three(&engine, &tmp);

    let report = clean_cache_files(&engine, &CleanOptions::new(3 * PAYLOAD_SIZE)).unwrap();
    assert_eq!(report.entries_deleted, 0);
    assert_eq!(report.final_usage, 3 * PAYLOAD_SIZE);
    assert_eq!(entry_count(store.as_ref()), 3);
}

#[test]
fn test_entries_sharing_a_file_go_together() {
    let (tmp, engine, store) = setup();
    let shared = cache_payload(&engine, &tmp, "pipeline.io:first", 7);
    cache_payload(&engine, &tmp, "pipeline.io:other", 8);
    let again = cache_payload(&engine, &tmp, "pipeline.io:second", 7);
    assert_eq!(shared, again);
    assert_eq!(entry_count(store.as_ref()), 3);

    let report = clean_cache_files(&engine, &CleanOptions::new(PAYLOAD_SIZE)).unwrap();

    assert_eq!(report.entries_deleted, 2);
    assert_eq!(report.files_deleted, 1);
    assert!(!shared.exists());
    assert_eq!(
        blob_contents(engine.blobs().root()),
        BTreeSet::from(["payload-008".to_string()])
    );
}

#[test]
fn test_database_accounting_ignores_unreferenced_files() {
    let (tmp, engine, store) = setup();
    cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    write_file(engine.blobs().root(), "stray.bin", b"0123456789");

    let options = CleanOptions {
        use_database: true,
        ..CleanOptions::new(0)
    };
    let report = clean_cache_files(&engine, &options).unwrap();

    assert_eq!(report.entries_deleted, 1);
    assert_eq!(report.final_usage, 0);
    assert_eq!(entry_count(store.as_ref()), 0);
    assert!(engine.blobs().root().join("stray.bin").exists());
}

#[test]
fn test_files_outside_the_root_are_not_tracked() {
    let (tmp, engine, store) = setup();
    let elsewhere = engine
        .with_settings(Settings::with_cache_dir(tmp.path().join("other")))
        .unwrap();
    let foreign = cache_payload(&elsewhere, &tmp, "pipeline.io:payload", 1);
    let local = cache_payload(&engine, &tmp, "pipeline.io:payload", 2);

    clean_cache_files(&engine, &CleanOptions::new(0)).unwrap();

    assert!(!local.exists());
    assert!(foreign.exists());
    assert_eq!(entry_count(store.as_ref()), 1);
}

// ============================================================================
// Validation and shortfall
// ============================================================================

#[test]
fn test_exclusive_tag_filters_fail_before_deleting() {
    let (tmp, engine, store) = setup();
    seed_three(&engine, &tmp);

    let options = CleanOptions {
        tags_to_clean: Some(vec![None]),
        tags_to_keep: Some(vec![Some("keep".into())]),
        ..CleanOptions::new(0)
    };
    let err = clean_cache_files(&engine, &options).unwrap_err();

    assert!(matches!(err, Error::Validation { .. }));
    assert!(err.to_string().contains("mutually exclusive"));
    assert_eq!(entry_count(store.as_ref()), 3);
    assert_eq!(usage(&engine), 3 * PAYLOAD_SIZE);
}

#[test]
fn test_kept_tags_cause_shortfall() {
    let (tmp, engine, store) = setup();
    let keeper = engine
        .with_settings(Settings {
            tag: Some("keep".into()),
            ..engine.settings().clone()
        })
        .unwrap();
    let kept = cache_payload(&keeper, &tmp, "pipeline.io:payload", 1);
    let dropped = cache_payload(&engine, &tmp, "pipeline.io:payload", 2);

    let options = CleanOptions {
        tags_to_keep: Some(vec![Some("keep".into())]),
        ..CleanOptions::new(0)
    };
    let (result, events) = capture_events(|| clean_cache_files(&engine, &options));
    let err = result.unwrap_err();

    assert!(matches!(
        err,
        Error::EvictionShortfall { usage, maxsize: 0, .. } if usage == PAYLOAD_SIZE
    ));
    assert!(err.is_fatal());
    assert!(err.to_string().starts_with("Unable to clean"));
    assert!(kept.exists());
    assert!(!dropped.exists());
    assert_eq!(entry_count(store.as_ref()), 1);
    assert!(
        events
            .iter()
            .any(|e| e.message == "check disk usage")
    );
}

#[test]
fn test_tags_to_clean_selects_untagged() {
    let (tmp, engine, store) = setup();
    let tagged = engine
        .with_settings(Settings {
            tag: Some("archive".into()),
            ..engine.settings().clone()
        })
        .unwrap();
    let archived = cache_payload(&tagged, &tmp, "pipeline.io:payload", 1);
    let scratch = cache_payload(&engine, &tmp, "pipeline.io:payload", 2);

    let options = CleanOptions {
        tags_to_clean: Some(vec![None]),
        ..CleanOptions::new(PAYLOAD_SIZE)
    };
    clean_cache_files(&engine, &options).unwrap();

    assert!(archived.exists());
    assert!(!scratch.exists());
    assert_eq!(entry_count(store.as_ref()), 1);
}

#[test]
fn test_unknown_files_cause_shortfall_without_sweep() {
    let (_tmp, engine, _store) = setup();
    write_file(engine.blobs().root(), "stray.bin", b"0123456789");

    let err = clean_cache_files(&engine, &CleanOptions::new(0)).unwrap_err();
    assert!(matches!(err, Error::EvictionShortfall { usage: 10, .. }));
}

// ============================================================================
// Unknown-file sweep
// ============================================================================

#[test]
fn test_sweep_removes_unknown_files_first() {
    let (tmp, engine, store) = setup();
    let cached = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let root = engine.blobs().root().to_path_buf();
    write_file(&root, "unknown.txt", b"x");
    fs::create_dir_all(root.join("unknown_dir/nested")).unwrap();
    write_file(&root.join("unknown_dir/nested"), "deep.txt", b"y");

    let options = CleanOptions {
        delete_unknown_files: true,
        ..CleanOptions::new(PAYLOAD_SIZE)
    };
    let report = clean_cache_files(&engine, &options).unwrap();

    assert_eq!(report.files_deleted, 2);
    assert_eq!(report.entries_deleted, 0);
    assert!(cached.exists());
    assert!(!root.join("unknown.txt").exists());
    assert!(!root.join("unknown_dir").exists());
    assert_eq!(entry_count(store.as_ref()), 1);
}

#[test]
fn test_sweep_respects_live_lock_markers() {
    let (tmp, engine, _store) = setup();
    let cached = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let root = engine.blobs().root().to_path_buf();
    write_file(&root, "unknown.txt", b"x");
    write_file(&root, "unknown.txt.lock", b"");
    write_file(&root, "orphan.txt", b"z");

    let options = CleanOptions {
        delete_unknown_files: true,
        ..CleanOptions::new(u64::MAX)
    };
    clean_cache_files(&engine, &options).unwrap();

    assert!(cached.exists());
    assert!(root.join("unknown.txt").exists());
    assert!(root.join("unknown.txt.lock").exists());
    assert!(!root.join("orphan.txt").exists());
}

#[test]
fn test_sweep_reclaims_expired_lock_markers() {
    let (tmp, engine, _store) = setup();
    let cached = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let root = engine.blobs().root().to_path_buf();
    write_file(&root, "unknown.txt", b"x");
    write_file(&root, "unknown.txt.lock", b"");
    std::thread::sleep(Duration::from_millis(20));

    let options = CleanOptions {
        delete_unknown_files: true,
        lock_validity_period: Some(Duration::from_millis(5)),
        ..CleanOptions::new(PAYLOAD_SIZE)
    };
    clean_cache_files(&engine, &options).unwrap();

    assert!(cached.exists());
    assert!(!root.join("unknown.txt").exists());
    assert!(!root.join("unknown.txt.lock").exists());
}

#[test]
fn test_sweep_and_database_accounting_are_exclusive() {
    let (_tmp, engine, _store) = setup();
    let options = CleanOptions {
        delete_unknown_files: true,
        use_database: true,
        ..CleanOptions::new(0)
    };
    assert!(matches!(
        clean_cache_files(&engine, &options).unwrap_err(),
        Error::Validation { .. }
    ));
}

// ============================================================================
// Batching
// ============================================================================

#[test]
fn test_batches_delete_everything() {
    let (tmp, engine, store) = setup();
    for i in 0..5 {
        cache_payload(&engine, &tmp, "pipeline.io:payload", i);
    }
    let options = CleanOptions {
        batch_size: Some(2),
        batch_delay: Duration::from_millis(1),
        ..CleanOptions::new(0)
    };
    let (report, events) = capture_events(|| clean_cache_files(&engine, &options).unwrap());

    assert_eq!(report.entries_deleted, 5);
    assert_eq!(report.files_deleted, 5);
    assert_eq!(entry_count(store.as_ref()), 0);
    let batches = events
        .iter()
        .filter(|e| e.message == "deleting cache entries")
        .count();
    assert_eq!(batches, 3);
}

// ============================================================================
// Expiration maintenance
// ============================================================================

#[test]
fn test_expire_dry_run_counts_without_mutating() {
    let (tmp, engine, store) = setup();
    cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let before = store.query(&EntryQuery::default()).unwrap();

    let options = ExpireOptions {
        dry_run: true,
        ..ExpireOptions::default()
    };
    assert_eq!(expire_cache_entries(&engine, &options).unwrap(), 1);
    assert_eq!(store.query(&EntryQuery::default()).unwrap(), before);
}

#[test]
fn test_expire_by_tag_and_window() {
    let (tmp, engine, store) = setup();
    let tagged = engine
        .with_settings(Settings {
            tag: Some("foo".into()),
            ..engine.settings().clone()
        })
        .unwrap();
    let tic = Utc::now() - TimeDelta::milliseconds(1);
    cache_payload(&tagged, &tmp, "pipeline.io:payload", 1);
    let toc = Utc::now() + TimeDelta::milliseconds(1);

    let nothing = ExpireOptions {
        tags: Some(vec![Some("bar".into())]),
        ..ExpireOptions::default()
    };
    assert_eq!(expire_cache_entries(&engine, &nothing).unwrap(), 0);
    let too_early = ExpireOptions {
        before: Some(tic),
        ..ExpireOptions::default()
    };
    assert_eq!(expire_cache_entries(&engine, &too_early).unwrap(), 0);
    let too_late = ExpireOptions {
        after: Some(toc),
        ..ExpireOptions::default()
    };
    assert_eq!(expire_cache_entries(&engine, &too_late).unwrap(), 0);

    let matching = ExpireOptions {
        tags: Some(vec![Some("foo".into())]),
        before: Some(toc),
        after: Some(tic),
        ..ExpireOptions::default()
    };
    assert_eq!(expire_cache_entries(&engine, &matching).unwrap(), 1);

    let stored = store.query(&EntryQuery::default()).unwrap();
    assert_eq!(stored.len(), 1);
    assert!(stored[0].expiration.is_expired_at(Utc::now()));
    // Already expired entries are not matched again
    assert_eq!(expire_cache_entries(&engine, &matching).unwrap(), 0);
}

#[test]
fn test_expire_with_delete_removes_entries_and_files() {
    let (tmp, engine, store) = setup();
    let blob = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);

    let options = ExpireOptions {
        delete: true,
        batch_size: Some(1),
        ..ExpireOptions::default()
    };
    assert_eq!(expire_cache_entries(&engine, &options).unwrap(), 1);
    assert_eq!(entry_count(store.as_ref()), 0);
    assert!(!blob.exists());
}

#[test]
fn test_soft_expired_call_recomputes() {
    let (tmp, engine, store) = setup();
    cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    expire_cache_entries(&engine, &ExpireOptions::default()).unwrap();
    cache_payload(&engine, &tmp, "pipeline.io:payload", 1);

    let stored = store.query(&EntryQuery::default()).unwrap();
    assert_eq!(stored.len(), 2);
    assert_eq!(
        stored
            .iter()
            .filter(|e| e.expiration == Expiration::Never)
            .count(),
        1
    );
}

// ============================================================================
// Invalid entries
// ============================================================================

#[test]
fn test_clean_invalid_removes_expired_entries_and_files() {
    let (tmp, engine, store) = setup();
    let expired = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let live = cache_payload(&engine, &tmp, "pipeline.io:payload", 2);
    let doomed: Vec<_> = store
        .query(&EntryQuery::default())
        .unwrap()
        .into_iter()
        .filter(|e| {
            file_assets(&e.result)
                .iter()
                .any(|a| a.path() == expired)
        })
        .map(|e| e.id())
        .collect();
    store
        .set_expiration(&doomed, Expiration::At(Utc::now()))
        .unwrap();

    let deleted =
        clean_invalid_cache_entries(&engine, true, false, Some(1), Duration::ZERO).unwrap();

    assert_eq!(deleted, 1);
    assert!(!expired.exists());
    assert!(live.exists());
    assert_eq!(entry_count(store.as_ref()), 1);
}

#[test]
fn test_clean_invalid_drops_undecodable_entries() {
    let (tmp, engine, store) = setup();
    let tampered = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let intact = cache_payload(&engine, &tmp, "pipeline.io:payload", 2);
    fs::write(&tampered, b"corrupted!!").unwrap();

    let untouched =
        clean_invalid_cache_entries(&engine, true, false, None, Duration::ZERO).unwrap();
    assert_eq!(untouched, 0);

    let deleted =
        clean_invalid_cache_entries(&engine, false, true, None, Duration::ZERO).unwrap();
    assert_eq!(deleted, 1);
    assert!(!tampered.exists());
    assert!(intact.exists());
    assert_eq!(entry_count(store.as_ref()), 1);
}

// ============================================================================
// Directory blobs and nested accounting
// ============================================================================

/// Cache a call returning the directory `src/outdir` with one nested file
fn cache_directory(engine: &CacheEngine, tmp: &TempDir) -> PathBuf {
    let src = tmp.path().join("src").join("outdir");
    let produce = move |_: &Args| -> callcache::Result<Value> {
        write_file(&src.join("sub"), "a", b"abc");
        Ok(Value::File(CachedFile::new(src.clone())))
    };
    let value = engine
        .cacheable("pipeline.io:directory", produce)
        .unwrap()
        .call(&Args::new())
        .unwrap();
    value.as_file().unwrap().path.clone()
}

/// Cache a call returning a 2x2 array; returns the blob path
fn cache_array(engine: &CacheEngine, store: &dyn MetadataStore) -> PathBuf {
    let produce = |_: &Args| -> callcache::Result<Value> {
        Ok(Value::Array(NdArray::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0])?))
    };
    engine
        .cacheable("pipeline.io:array", produce)
        .unwrap()
        .call(&Args::new())
        .unwrap();
    let entries = store.query(&EntryQuery::default()).unwrap();
    entries
        .iter()
        .flat_map(|e| file_assets(&e.result))
        .find(|a| a.content_kind == DIRECTORY_STORE_KIND)
        .map(|a| a.path().to_path_buf())
        .unwrap()
}

fn zarr_engine(engine: &CacheEngine) -> CacheEngine {
    engine
        .with_settings(Settings {
            array_content_kind: DIRECTORY_STORE_KIND.into(),
            ..engine.settings().clone()
        })
        .unwrap()
}

#[test]
fn test_directory_result_is_removed_whole() {
    let (tmp, engine, store) = setup();
    let blob = cache_directory(&engine, &tmp);
    assert!(blob.join("sub").join("a").is_file());

    let report = clean_cache_files(&engine, &CleanOptions::new(0)).unwrap();

    assert_eq!(report.entries_deleted, 1);
    assert_eq!(report.files_deleted, 1);
    assert_eq!(report.final_usage, 0);
    assert!(!blob.exists());
    assert_eq!(entry_count(store.as_ref()), 0);
}

#[test]
fn test_undecodable_directory_result_self_heals() {
    let (tmp, engine, store) = setup();
    let blob = cache_directory(&engine, &tmp);
    fs::write(blob.join("sub").join("a"), b"xyz").unwrap();

    let (_, events) = capture_events(|| cache_directory(&engine, &tmp));

    assert!(
        events
            .iter()
            .all(|e| !e.message.starts_with("Cannot remove file"))
    );
    assert_eq!(entry_count(store.as_ref()), 1);
    assert_eq!(fs::read(blob.join("sub").join("a")).unwrap(), b"abc");
}

#[test]
fn test_directory_store_array_is_evicted() {
    let (_tmp, engine, store) = setup();
    let engine = zarr_engine(&engine);
    let blob = cache_array(&engine, store.as_ref());
    assert!(blob.is_dir());

    let report = clean_cache_files(&engine, &CleanOptions::new(0)).unwrap();

    assert_eq!(report.entries_deleted, 1);
    assert!(!blob.exists());
    assert_eq!(entry_count(store.as_ref()), 0);
}

#[test]
fn test_deeper_units_still_evict_directory_stores() {
    let (tmp, engine, store) = setup();
    let zarr = zarr_engine(&engine);
    let array = cache_array(&zarr, store.as_ref());
    let file = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let array_size = usage(&engine) - PAYLOAD_SIZE;

    // Units split the array into its members; the newer file entry fits
    let options = CleanOptions {
        depth: 2,
        ..CleanOptions::new(PAYLOAD_SIZE)
    };
    let report = clean_cache_files(&engine, &options).unwrap();

    assert_eq!(report.entries_deleted, 1);
    assert_eq!(report.bytes_freed, array_size);
    assert_eq!(report.final_usage, PAYLOAD_SIZE);
    assert!(!array.exists());
    assert!(file.exists());
    assert_eq!(entry_count(store.as_ref()), 1);
}

#[test]
fn test_deeper_units_sweep_nested_unknown_directories() {
    let (tmp, engine, _store) = setup();
    let cached = cache_payload(&engine, &tmp, "pipeline.io:payload", 1);
    let root = engine.blobs().root().to_path_buf();
    write_file(&root.join("archive/2023"), "old.bin", b"0123");
    write_file(&root.join("archive/2024"), "new.bin", b"4567");
    write_file(&root.join("archive"), "2024.lock", b"");

    let options = CleanOptions {
        depth: 2,
        delete_unknown_files: true,
        ..CleanOptions::new(PAYLOAD_SIZE + 4)
    };
    let report = clean_cache_files(&engine, &options).unwrap();

    assert_eq!(report.files_deleted, 1);
    assert!(!root.join("archive/2023").exists());
    assert!(root.join("archive/2024/new.bin").exists());
    assert!(root.join("archive/2024.lock").exists());
    assert!(cached.exists());
}
