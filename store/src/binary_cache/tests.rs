use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use ferrix_compat::{
    narinfo::{parse_keypair, NarInfo},
    nix_http::CACHE_INFO_FILE,
    store_path::StorePath,
};
use pretty_assertions::assert_eq;
use rstest::rstest;

use super::{
    http::tests::serve, BinaryCacheBackend, BinaryCacheStore, CacheInfo, HttpBinaryCache,
    LocalBinaryCache, MemoryBinaryCache,
};
use crate::{
    disk_cache::{NarInfoDiskCache, NarInfoLookup},
    tests::fixtures::{DUMMY_KEYPAIR, NARINFO_CURL},
    Error, LocalStore, Store,
};

#[test]
fn cache_info_parse() {
    let info = CacheInfo::parse("StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 40\nFoo: bar\n")
        .unwrap();
    assert_eq!(
        CacheInfo {
            store_dir: "/nix/store".into(),
            want_mass_query: true,
            priority: 40,
        },
        info
    );
    assert_eq!(
        "StoreDir: /nix/store\nWantMassQuery: 1\nPriority: 40\n",
        info.to_string()
    );

    CacheInfo::parse("Priority: high").expect_err("must fail");
}

#[tokio::test]
async fn open_writes_cache_info() {
    let store = BinaryCacheStore::open(MemoryBinaryCache::default())
        .await
        .unwrap();
    assert_eq!(&CacheInfo::default(), store.cache_info());
    assert!(store.backend().file_exists(CACHE_INFO_FILE).await.unwrap());
}

#[tokio::test]
async fn open_rejects_other_store_dir() {
    let backend = MemoryBinaryCache::default();
    backend
        .upsert_file(CACHE_INFO_FILE, "StoreDir: /gnu/store\n".into(), "text/plain")
        .await
        .unwrap();
    assert!(matches!(
        BinaryCacheStore::open(backend).await,
        Err(Error::InvalidRequest(_))
    ));
}

#[rstest]
#[case::xz(Some("xz"), ".nar.xz")]
#[case::zstd(Some("zstd"), ".nar.zst")]
#[case::none(None, ".nar")]
#[tokio::test]
async fn add_and_read_back(#[case] compression: Option<&str>, #[case] suffix: &str) {
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("hello"), "Hello World!").unwrap();

    let store = BinaryCacheStore::open(MemoryBinaryCache::default())
        .await
        .unwrap()
        .with_compression(compression)
        .unwrap();

    let path = store
        .add_to_store_recursive("hello", &src.path().join("hello"), None)
        .await
        .unwrap();
    assert_eq!("n4hss129xrln71w0nss39bcx6hzsh9bg-hello", path.to_string());

    let narinfo = store.query_path_info_uncached(&path).await.unwrap().unwrap();
    assert!(narinfo.url.starts_with("nar/"));
    assert!(narinfo.url.ends_with(suffix));
    assert_eq!(
        compression.unwrap_or("none"),
        narinfo.compression.as_deref().unwrap_or("none")
    );
    assert!(store.backend().file_exists(&narinfo.url).await.unwrap());

    let info = store.query_path_info(&path).await.unwrap().unwrap();
    assert!(info.is_content_addressed());

    let nar = store.nar_from_path(&path).await.unwrap();
    assert_eq!(info.nar_size, nar.len() as u64);
    assert!(store.is_valid_path(&path).await.unwrap());
}

#[tokio::test]
async fn nar_matches_local_store() {
    let src = tempfile::tempdir().unwrap();
    std::fs::create_dir(src.path().join("tree")).unwrap();
    std::fs::write(src.path().join("tree/a"), "a").unwrap();
    std::os::unix::fs::symlink("a", src.path().join("tree/b")).unwrap();

    let local_dir = tempfile::tempdir().unwrap();
    let local = LocalStore::open(local_dir.path()).await.unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let cache = BinaryCacheStore::open(LocalBinaryCache::new(cache_dir.path()))
        .await
        .unwrap();

    let tree = src.path().join("tree");
    let p1 = local.add_to_store_recursive("tree", &tree, None).await.unwrap();
    let p2 = cache.add_to_store_recursive("tree", &tree, None).await.unwrap();
    assert_eq!(p1, p2);
    assert_eq!(
        local.nar_from_path(&p1).await.unwrap(),
        cache.nar_from_path(&p2).await.unwrap()
    );
    assert!(cache_dir
        .path()
        .join(format!("{}.narinfo", p2.hash_part()))
        .is_file());
}

#[tokio::test]
async fn add_checks_nar_and_references() {
    let store = BinaryCacheStore::open(MemoryBinaryCache::default())
        .await
        .unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), "x").unwrap();
    let path = store
        .add_to_store_flat("f", &src.path().join("f"))
        .await
        .unwrap();
    let nar = store.nar_from_path(&path).await.unwrap();
    let info = store.query_path_info(&path).await.unwrap().unwrap();

    // wrong contents
    let mut other = info.clone();
    other.store_path = StorePath::from_bytes(b"00bgd045z0d4icpbc2yyz4gx48ak44la-other").unwrap();
    assert!(matches!(
        store.add_to_store(other.clone(), Bytes::from_static(b"garbage")).await,
        Err(Error::HashMismatch { .. })
    ));

    // dangling reference
    other.references.insert(
        StorePath::from_bytes(b"7n0mbqydcipkpbxm24fab066lxk68aqk-libunistring-1.1").unwrap(),
    );
    assert!(matches!(
        store.add_to_store(other.clone(), nar.clone()).await,
        Err(Error::InvalidRequest(_))
    ));

    // valid and self references are fine
    other.references.clear();
    other.references.insert(path.clone());
    other.references.insert(other.store_path.clone());
    store.add_to_store(other.clone(), nar).await.unwrap();
    assert!(store.is_valid_path(&other.store_path).await.unwrap());
}

#[tokio::test]
async fn add_signatures_append_only() {
    let store = BinaryCacheStore::open(MemoryBinaryCache::default())
        .await
        .unwrap();
    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), "x").unwrap();
    let path = store
        .add_to_store_flat("f", &src.path().join("f"))
        .await
        .unwrap();

    let (signing_key, verifying_key) = parse_keypair(DUMMY_KEYPAIR).unwrap();
    let mut info = store.query_path_info(&path).await.unwrap().unwrap();
    info.sign(&signing_key);
    let sig = info.signatures.clone();

    store.add_signatures(&path, sig.clone()).await.unwrap();
    store.add_signatures(&path, sig).await.unwrap();
    store.add_signatures(&path, vec![]).await.unwrap();

    let info = store.query_path_info(&path).await.unwrap().unwrap();
    assert_eq!(1, info.signatures.len());
    assert_eq!(1, info.count_valid_signatures(&[verifying_key]));
}

#[tokio::test]
async fn disk_cache_answers_repeated_queries() {
    let narinfo = NarInfo::parse(NARINFO_CURL).unwrap();
    let base = serve(HashMap::from([(
        "syd87l2rxw8cbsxmxl853h0r6pdwhwjr.narinfo",
        (200, NARINFO_CURL.as_bytes()),
    )]))
    .await;

    let disk_cache = Arc::new(NarInfoDiskCache::new_temporary().unwrap());
    let store = BinaryCacheStore::open(HttpBinaryCache::new(base.clone()))
        .await
        .unwrap()
        .with_disk_cache(disk_cache.clone())
        .await
        .unwrap();
    let uri = store.backend().uri();
    assert!(disk_cache.up_to_date_cache_exists(&uri).await.unwrap().is_some());

    let missing = StorePath::from_bytes(b"00bgd045z0d4icpbc2yyz4gx48ak44la-missing").unwrap();
    assert_eq!(
        Some(narinfo.clone()),
        store.query_narinfo(&narinfo.store_path).await.unwrap()
    );
    assert_eq!(None, store.query_narinfo(&missing).await.unwrap());

    assert_eq!(
        NarInfoLookup::Valid(Box::new(narinfo.clone())),
        disk_cache
            .lookup_nar_info(&uri, &narinfo.store_path.hash_part())
            .await
            .unwrap()
    );
    assert_eq!(
        NarInfoLookup::Invalid,
        disk_cache
            .lookup_nar_info(&uri, &missing.hash_part())
            .await
            .unwrap()
    );
    assert!(!store.is_valid_path(&missing).await.unwrap());
}

#[tokio::test]
async fn http_is_read_only() {
    let base = serve(HashMap::new()).await;
    let store = BinaryCacheStore::open(HttpBinaryCache::new(base))
        .await
        .unwrap();
    assert_eq!(&CacheInfo::default(), store.cache_info());

    let src = tempfile::tempdir().unwrap();
    std::fs::write(src.path().join("f"), "x").unwrap();
    assert!(matches!(
        store.add_to_store_flat("f", &src.path().join("f")).await,
        Err(Error::ReadOnly(_))
    ));
}
