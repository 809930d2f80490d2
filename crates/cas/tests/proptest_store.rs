//! Property tests for blob naming and disk accounting

#![allow(clippy::unwrap_used, clippy::expect_used)]

use callcache_cas::{BlobStore, checksum};
use proptest::prelude::*;
use std::fs;
use tempfile::TempDir;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn stored_blob_is_named_after_its_content(content in proptest::collection::vec(any::<u8>(), 0..512)) {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("input.bin");
        fs::write(&src, &content).unwrap();

        let store = BlobStore::new(tmp.path().join("blobs"));
        let asset = store.put_file(&src, false).unwrap();

        prop_assert_eq!(&asset.checksum, &checksum(&src).unwrap());
        prop_assert_eq!(asset.size, content.len() as u64);
        prop_assert_eq!(fs::read(asset.path()).unwrap(), content);
        prop_assert_eq!(store.verify(&asset).unwrap(), asset.path().to_path_buf());
    }

    #[test]
    fn disk_usage_totals_do_not_depend_on_depth(
        sizes in proptest::collection::vec(0usize..256, 1..6),
        depth in 1usize..4,
    ) {
        let tmp = TempDir::new().unwrap();
        let store = BlobStore::new(tmp.path().join("blobs"));
        let nested = store.root().join("tree.zarr").join("chunks");
        fs::create_dir_all(&nested).unwrap();
        for (i, size) in sizes.iter().enumerate() {
            let dir = if i % 2 == 0 { store.root().to_path_buf() } else { nested.clone() };
            fs::write(dir.join(format!("part-{i}")), vec![7u8; *size]).unwrap();
        }

        let expected: u64 = sizes.iter().map(|s| *s as u64).sum();
        let total: u64 = store.disk_usage(depth).unwrap().values().sum();
        prop_assert_eq!(total, expected);
    }
}
