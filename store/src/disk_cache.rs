//! Remembers narinfo lookups against binary caches, including misses, so
//! repeated queries don't go to the network.

use std::{path::PathBuf, sync::Arc};

use ferrix_compat::narinfo::NarInfo;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::{binary_cache::CacheInfo, utils::now, Error};

/// How long `nix-cache-info` contents are trusted.
pub const CACHE_INFO_TTL: u64 = 7 * 24 * 60 * 60;
/// How long a narinfo that was found is trusted.
pub const POSITIVE_TTL: u64 = 30 * 24 * 60 * 60;
/// How long a narinfo that was not found is remembered as missing.
pub const NEGATIVE_TTL: u64 = 60 * 60;

const CACHES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("caches");
const NARS_TABLE: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("nars");

#[derive(Serialize, Deserialize)]
struct CacheRecord {
    timestamp: u64,
    info: CacheInfo,
}

#[derive(Serialize, Deserialize)]
struct NarRecord {
    timestamp: u64,
    /// None records a miss.
    narinfo: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum NarInfoLookup {
    /// The cache has the path.
    Valid(Box<NarInfo>),
    /// The cache was recently asked and doesn't have the path.
    Invalid,
    /// Nothing (current) is known, ask the cache.
    Unknown,
}

type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub struct NarInfoDiskCache {
    // We wrap db in an Arc to be able to move it into spawn_blocking,
    // as discussed in https://github.com/cberner/redb/issues/789
    db: Arc<Database>,
    clock: Clock,
}

impl NarInfoDiskCache {
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
        .await??;

        Ok(Self {
            db: Arc::new(db),
            clock: Arc::new(now),
        })
    }

    /// Constructs a new instance using the in-memory backend.
    pub fn new_temporary() -> Result<Self, Error> {
        let db =
            redb::Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        create_schema(&db)?;

        Ok(Self {
            db: Arc::new(db),
            clock: Arc::new(now),
        })
    }

    /// Replaces the source of the current time (seconds since the epoch).
    pub fn with_clock(mut self, clock: impl Fn() -> u64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Records (or refreshes) the `nix-cache-info` of the cache at `uri`.
    pub async fn create_cache(&self, uri: &str, info: &CacheInfo) -> Result<(), Error> {
        let db = self.db.clone();
        let key = uri.to_string();
        let record = serde_json::to_vec(&CacheRecord {
            timestamp: (self.clock)(),
            info: info.clone(),
        })?;

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(CACHES_TABLE)?;
                table.insert(key.as_str(), record.as_slice())?;
            }
            Ok(txn.commit()?)
        })
        .await?
    }

    /// Returns the recorded `nix-cache-info` of `uri`, unless it's older
    /// than [CACHE_INFO_TTL].
    pub async fn up_to_date_cache_exists(&self, uri: &str) -> Result<Option<CacheInfo>, Error> {
        let db = self.db.clone();
        let key = uri.to_string();

        let record = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(CACHES_TABLE)?;
            let record = table.get(key.as_str())?;
            Ok(record.map(|r| r.value().to_vec()))
        })
        .await??;

        let Some(record) = record else {
            return Ok(None);
        };
        let record: CacheRecord = serde_json::from_slice(&record)?;
        if (self.clock)() >= record.timestamp.saturating_add(CACHE_INFO_TTL) {
            debug!(uri, "cache info expired");
            return Ok(None);
        }
        Ok(Some(record.info))
    }

    #[instrument(level = "trace", skip(self), err)]
    pub async fn lookup_nar_info(&self, uri: &str, hash_part: &str) -> Result<NarInfoLookup, Error> {
        let db = self.db.clone();
        let (uri_key, hash_key) = (uri.to_string(), hash_part.to_string());

        let record = tokio::task::spawn_blocking(move || -> Result<_, Error> {
            let txn = db.begin_read()?;
            let table = txn.open_table(NARS_TABLE)?;
            let record = table.get((uri_key.as_str(), hash_key.as_str()))?;
            Ok(record.map(|r| r.value().to_vec()))
        })
        .await??;

        let Some(record) = record else {
            return Ok(NarInfoLookup::Unknown);
        };
        let record: NarRecord = serde_json::from_slice(&record)?;
        let now = (self.clock)();

        Ok(match record.narinfo {
            Some(_) if now >= record.timestamp.saturating_add(POSITIVE_TTL) => NarInfoLookup::Unknown,
            None if now >= record.timestamp.saturating_add(NEGATIVE_TTL) => NarInfoLookup::Unknown,
            None => NarInfoLookup::Invalid,
            Some(text) => match NarInfo::parse(&text) {
                Ok(narinfo) => NarInfoLookup::Valid(Box::new(narinfo)),
                Err(e) => {
                    warn!(err = %e, "discarding unparseable cached narinfo");
                    NarInfoLookup::Unknown
                }
            },
        })
    }

    /// Records the outcome of a narinfo lookup, None meaning it wasn't found.
    pub async fn upsert_nar_info(
        &self,
        uri: &str,
        hash_part: &str,
        narinfo: Option<&NarInfo>,
    ) -> Result<(), Error> {
        let db = self.db.clone();
        let (uri_key, hash_key) = (uri.to_string(), hash_part.to_string());
        let record = serde_json::to_vec(&NarRecord {
            timestamp: (self.clock)(),
            narinfo: narinfo.map(ToString::to_string),
        })?;

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(NARS_TABLE)?;
                table.insert((uri_key.as_str(), hash_key.as_str()), record.as_slice())?;
            }
            Ok(txn.commit()?)
        })
        .await?
    }
}

/// Ensures all tables are present.
fn create_schema(db: &redb::Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(CACHES_TABLE)?;
    txn.open_table(NARS_TABLE)?;
    txn.commit()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    };

    use ferrix_compat::narinfo::NarInfo;
    use pretty_assertions::assert_eq;

    use super::{NarInfoDiskCache, NarInfoLookup, CACHE_INFO_TTL, NEGATIVE_TTL, POSITIVE_TTL};
    use crate::{binary_cache::CacheInfo, tests::fixtures::NARINFO_CURL};

    const URI: &str = "https://cache.nixos.org";
    const T0: u64 = 1_700_000_000;

    fn cache_with_clock() -> (NarInfoDiskCache, Arc<AtomicU64>) {
        let time = Arc::new(AtomicU64::new(T0));
        let cache = NarInfoDiskCache::new_temporary().unwrap().with_clock({
            let time = time.clone();
            move || time.load(Ordering::SeqCst)
        });
        (cache, time)
    }

    #[tokio::test]
    async fn cache_info_expires() {
        let (cache, time) = cache_with_clock();
        assert_eq!(None, cache.up_to_date_cache_exists(URI).await.unwrap());

        let info = CacheInfo {
            want_mass_query: true,
            priority: 40,
            ..Default::default()
        };
        cache.create_cache(URI, &info).await.unwrap();
        assert_eq!(Some(info), cache.up_to_date_cache_exists(URI).await.unwrap());

        time.store(T0 + CACHE_INFO_TTL, Ordering::SeqCst);
        assert_eq!(None, cache.up_to_date_cache_exists(URI).await.unwrap());
    }

    #[tokio::test]
    async fn positive_entries() {
        let (cache, time) = cache_with_clock();
        let narinfo = NarInfo::parse(NARINFO_CURL).unwrap();
        let hash_part = narinfo.store_path.hash_part();

        assert_eq!(
            NarInfoLookup::Unknown,
            cache.lookup_nar_info(URI, &hash_part).await.unwrap()
        );

        cache
            .upsert_nar_info(URI, &hash_part, Some(&narinfo))
            .await
            .unwrap();
        assert_eq!(
            NarInfoLookup::Valid(Box::new(narinfo.clone())),
            cache.lookup_nar_info(URI, &hash_part).await.unwrap()
        );

        // other caches don't see it
        assert_eq!(
            NarInfoLookup::Unknown,
            cache
                .lookup_nar_info("https://example.org", &hash_part)
                .await
                .unwrap()
        );

        time.store(T0 + POSITIVE_TTL - 1, Ordering::SeqCst);
        assert!(matches!(
            cache.lookup_nar_info(URI, &hash_part).await.unwrap(),
            NarInfoLookup::Valid(_)
        ));
        time.store(T0 + POSITIVE_TTL, Ordering::SeqCst);
        assert_eq!(
            NarInfoLookup::Unknown,
            cache.lookup_nar_info(URI, &hash_part).await.unwrap()
        );
    }

    #[tokio::test]
    async fn negative_entries() {
        let (cache, time) = cache_with_clock();
        let hash_part = "00bgd045z0d4icpbc2yyz4gx48ak44la";

        cache.upsert_nar_info(URI, hash_part, None).await.unwrap();
        assert_eq!(
            NarInfoLookup::Invalid,
            cache.lookup_nar_info(URI, hash_part).await.unwrap()
        );

        time.store(T0 + NEGATIVE_TTL, Ordering::SeqCst);
        assert_eq!(
            NarInfoLookup::Unknown,
            cache.lookup_nar_info(URI, hash_part).await.unwrap()
        );
    }

    #[tokio::test]
    async fn persists_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache/binary-cache-v7.redb");
        {
            let cache = NarInfoDiskCache::new(path.clone()).await.unwrap();
            cache
                .upsert_nar_info(URI, "00bgd045z0d4icpbc2yyz4gx48ak44la", None)
                .await
                .unwrap();
        }

        let cache = NarInfoDiskCache::new(path).await.unwrap();
        assert_eq!(
            NarInfoLookup::Invalid,
            cache
                .lookup_nar_info(URI, "00bgd045z0d4icpbc2yyz4gx48ak44la")
                .await
                .unwrap()
        );
    }
}
