//! Memoizes fetch results: a set of input attributes maps to the resulting
//! store path plus attributes learned while fetching (revisions, ETags).
//!
//! Unlocked entries (keyed by something that can move, like a branch name or
//! URL) expire after the TTL. Locked entries (keyed by a revision or content
//! hash) never expire.

use std::{path::PathBuf, sync::Arc};

use ferrix_compat::{nixcpp::conf::DEFAULT_TARBALL_TTL, store_path::StorePath};
use ferrix_store::Store;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{attrs::Attrs, Error};

const FETCHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("fetches");

#[derive(Serialize, Deserialize)]
struct Record {
    info: Attrs,
    store_path: StorePath,
    locked: bool,
    timestamp: u64,
}

/// A cache hit, possibly expired.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedEntry {
    pub expired: bool,
    pub info: Attrs,
    pub store_path: StorePath,
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct FetchCache {
    // Arc'ed to be movable into spawn_blocking.
    db: Arc<Database>,
    ttl: u64,
    clock: Clock,
}

fn now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

fn cache_key(attrs: &Attrs) -> Result<String, Error> {
    Ok(serde_json::to_string(attrs)?)
}

impl FetchCache {
    /// Opens (or creates) the database at `path`.
    pub async fn new(path: PathBuf) -> Result<Self, Error> {
        let db = tokio::task::spawn_blocking(|| -> Result<_, redb::Error> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(redb::StorageError::from)?;
            }
            let db = redb::Database::create(path)?;
            create_schema(&db)?;
            Ok(db)
        })
        .await?
        .map_err(|e| Error::Cache(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            ttl: DEFAULT_TARBALL_TTL,
            clock: Arc::new(now),
        })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db = redb::Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| Error::Cache(e.to_string()))?;
        create_schema(&db).map_err(|e| Error::Cache(e.to_string()))?;

        Ok(Self {
            db: Arc::new(db),
            ttl: DEFAULT_TARBALL_TTL,
            clock: Arc::new(now),
        })
    }

    /// Sets how many seconds unlocked entries stay fresh.
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replaces the source of the current time (seconds since the epoch).
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Records the result of fetching `input`. Overwrites what was recorded
    /// for the same attributes before.
    #[instrument(level = "trace", skip_all, fields(store_path = %store_path, locked = locked), err)]
    pub async fn add(
        &self,
        input: &Attrs,
        info: &Attrs,
        store_path: &StorePath,
        locked: bool,
    ) -> Result<(), Error> {
        let key = cache_key(input)?;
        let record = serde_json::to_vec(&Record {
            info: info.clone(),
            store_path: store_path.clone(),
            locked,
            timestamp: (self.clock)(),
        })?;
        let db = self.db.clone();

        tokio::task::spawn_blocking(move || -> Result<(), ferrix_store::Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(FETCHES_TABLE)?;
                table.insert(key.as_str(), record.as_slice())?;
            }
            Ok(txn.commit()?)
        })
        .await??;
        Ok(())
    }

    /// Like [FetchCache::lookup], but also returns expired unlocked entries,
    /// marked as such.
    pub async fn lookup_expired(
        &self,
        store: &dyn Store,
        input: &Attrs,
    ) -> Result<Option<CachedEntry>, Error> {
        let key = cache_key(input)?;
        let db = self.db.clone();
        let lookup_key = key.clone();

        let record = tokio::task::spawn_blocking(move || -> Result<_, ferrix_store::Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(FETCHES_TABLE)?;
            let record = table.get(lookup_key.as_str())?;
            Ok(record.map(|r| r.value().to_vec()))
        })
        .await??;

        let Some(record) = record else {
            debug!(key, "fetch cache miss");
            return Ok(None);
        };
        let record: Record = serde_json::from_slice(&record)?;

        if !store.is_valid_path(&record.store_path).await? {
            debug!(key, store_path = %record.store_path, "cached store path is no longer valid");
            return Ok(None);
        }

        let expired =
            !record.locked && (self.clock)() >= record.timestamp.saturating_add(self.ttl);
        debug!(key, expired, "fetch cache hit");

        Ok(Some(CachedEntry {
            expired,
            info: record.info,
            store_path: record.store_path,
        }))
    }

    /// Returns the info attributes and store path recorded for `input`,
    /// unless the entry expired or its path is gone from `store`.
    pub async fn lookup(
        &self,
        store: &dyn Store,
        input: &Attrs,
    ) -> Result<Option<(Attrs, StorePath)>, Error> {
        Ok(self
            .lookup_expired(store, input)
            .await?
            .filter(|entry| !entry.expired)
            .map(|entry| (entry.info, entry.store_path)))
    }
}

fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(FETCHES_TABLE)?;
    txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use ferrix_store::{LocalStore, Store};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::{CachedEntry, FetchCache};
    use crate::attrs::{attrs, Attr};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: LocalStore,
        cache: FetchCache,
        clock: Arc<AtomicU64>,
        path: ferrix_compat::store_path::StorePath,
    }

    async fn fixture() -> Fixture {
        fixture_with_ttl(100).await
    }

    async fn fixture_with_ttl(ttl: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("store")).await.unwrap();
        let src = dir.path().join("hello");
        std::fs::write(&src, "Hello World!").unwrap();
        let path = store.add_to_store_flat("hello", &src).await.unwrap();

        let clock = Arc::new(AtomicU64::new(1000));
        let cache = FetchCache::new_temporary().unwrap().with_ttl(ttl).with_clock({
            let clock = clock.clone();
            move || clock.load(Ordering::SeqCst)
        });

        Fixture {
            _dir: dir,
            store,
            cache,
            clock,
            path,
        }
    }

    fn key() -> crate::attrs::Attrs {
        attrs([("type", "file"), ("url", "https://example.org/hello")])
    }

    fn info() -> crate::attrs::Attrs {
        attrs([("etag", Attr::from("\"abc\"")), ("lastModified", Attr::from(5u64))])
    }

    #[tokio::test]
    async fn miss() {
        let f = fixture().await;
        assert_eq!(None, f.cache.lookup(&f.store, &key()).await.unwrap());
    }

    #[rstest]
    #[case::fresh(100, false, 99, Some(false))]
    #[case::unlocked_at_ttl(100, false, 100, Some(true))]
    #[case::unlocked_after_ttl(100, false, 5000, Some(true))]
    #[case::locked_never_expires(100, true, 1_000_000, Some(false))]
    #[case::huge_ttl(u64::MAX, false, 1_000_000, Some(false))]
    #[tokio::test]
    async fn expiry(
        #[case] ttl: u64,
        #[case] locked: bool,
        #[case] elapsed: u64,
        #[case] expired: Option<bool>,
    ) {
        let f = fixture_with_ttl(ttl).await;
        f.cache.add(&key(), &info(), &f.path, locked).await.unwrap();
        f.clock.fetch_add(elapsed, Ordering::SeqCst);

        let entry = f.cache.lookup_expired(&f.store, &key()).await.unwrap();
        assert_eq!(expired, entry.as_ref().map(|e| e.expired));

        let fresh = f.cache.lookup(&f.store, &key()).await.unwrap();
        assert_eq!(expired == Some(false), fresh.is_some());
    }

    #[tokio::test]
    async fn last_write_wins() {
        let f = fixture().await;
        f.cache.add(&key(), &info(), &f.path, false).await.unwrap();
        f.cache.add(&key(), &info(), &f.path, false).await.unwrap();

        let newer = attrs([("etag", "\"def\"")]);
        f.cache.add(&key(), &newer, &f.path, false).await.unwrap();

        assert_eq!(
            Some(CachedEntry {
                expired: false,
                info: newer,
                store_path: f.path.clone(),
            }),
            f.cache.lookup_expired(&f.store, &key()).await.unwrap()
        );
    }

    #[tokio::test]
    async fn invalid_store_path_is_ignored() {
        let f = fixture().await;
        let other = ferrix_compat::store_path::StorePath::from_bytes(
            b"00bgd045z0d4icpbc2yyz4gx48ak44la-net-tools-1.60_p20170221182432",
        )
        .unwrap();
        f.cache.add(&key(), &info(), &other, true).await.unwrap();
        assert_eq!(None, f.cache.lookup(&f.store, &key()).await.unwrap());
        assert!(!f.store.is_valid_path(&other).await.unwrap());
    }

    #[tokio::test]
    async fn persists_on_disk() {
        let f = fixture().await;
        let db = f._dir.path().join("cache/fetcher-cache-v1.redb");
        {
            let cache = FetchCache::new(db.clone()).await.unwrap();
            cache.add(&key(), &info(), &f.path, true).await.unwrap();
        }
        let cache = FetchCache::new(db).await.unwrap();
        assert_eq!(
            Some((info(), f.path.clone())),
            cache.lookup(&f.store, &key()).await.unwrap()
        );
    }
}
