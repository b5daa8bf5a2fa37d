use std::sync::Arc;

use ferrix_store::Store;

use crate::{cache::FetchCache, Error, FetchSettings};

/// File name of the fetch cache database inside the cache directory.
pub const FETCH_CACHE_FILE: &str = "fetcher-cache-v1.redb";

/// Everything a fetch needs besides the input itself: where results go,
/// the cache, settings and an HTTP client.
#[derive(Clone)]
pub struct FetchContext {
    pub store: Arc<dyn Store>,
    pub cache: Arc<FetchCache>,
    pub settings: Arc<FetchSettings>,
    pub http: reqwest::Client,
}

impl FetchContext {
    pub fn new(store: Arc<dyn Store>, cache: FetchCache, settings: FetchSettings) -> Self {
        Self {
            store,
            cache: Arc::new(cache),
            settings: Arc::new(settings),
            http: reqwest::Client::new(),
        }
    }

    /// Opens the fetch cache in the configured cache directory, expiring
    /// entries after the configured TTL.
    pub async fn open(store: Arc<dyn Store>, settings: FetchSettings) -> Result<Self, Error> {
        let cache = FetchCache::new(settings.cache_dir.join(FETCH_CACHE_FILE))
            .await?
            .with_ttl(settings.tarball_ttl);
        Ok(Self::new(store, cache, settings))
    }
}
