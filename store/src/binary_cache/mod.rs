//! Stores laid out as a Nix binary cache: `nix-cache-info`,
//! `<hashpart>.narinfo` files and compressed NARs below `nar/`.

use std::{
    fmt::{self, Display},
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use ferrix_compat::{
    narinfo::{NarInfo, Signature},
    nix_http::{compression_extension, nar_url, narinfo_file_name, CACHE_INFO_FILE},
    nixhash::{CAHash, NixHash},
    store_path::{build_ca_path, StorePath, STORE_DIR},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::{
    disk_cache::{NarInfoDiskCache, NarInfoLookup},
    nar::{dump_path, PathFilter},
    utils::now,
    Error, PathInfo, Store,
};

mod compression;
mod http;
mod local;
mod memory;

pub use http::HttpBinaryCache;
pub use local::LocalBinaryCache;
pub use memory::MemoryBinaryCache;

/// Where the files of a binary cache live.
///
/// Every operation is idempotent. Paths are relative to the cache root,
/// like `nar/$filehash.nar.xz`.
#[async_trait]
pub trait BinaryCacheBackend: Send + Sync {
    fn uri(&self) -> String;

    async fn file_exists(&self, path: &str) -> Result<bool, Error>;

    async fn upsert_file(&self, path: &str, data: Bytes, mime_type: &str) -> Result<(), Error>;

    /// Returns None if the file doesn't exist.
    async fn get_file(&self, path: &str) -> Result<Option<Bytes>, Error>;
}

/// The contents of `nix-cache-info`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub store_dir: String,
    pub want_mass_query: bool,
    pub priority: u64,
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self {
            store_dir: STORE_DIR.to_string(),
            want_mass_query: false,
            priority: 50,
        }
    }
}

impl CacheInfo {
    /// Parses `Key: value` lines. Unknown keys are ignored.
    pub fn parse(input: &str) -> Result<Self, Error> {
        let mut out = Self::default();
        for line in input.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            let invalid = || Error::InvalidRequest(format!("invalid {CACHE_INFO_FILE} line: {line}"));

            match key.trim() {
                "StoreDir" => out.store_dir = value.to_string(),
                "WantMassQuery" => out.want_mass_query = value == "1",
                "Priority" => out.priority = value.parse().map_err(|_| invalid())?,
                _ => {}
            }
        }
        Ok(out)
    }
}

impl Display for CacheInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "StoreDir: {}", self.store_dir)?;
        writeln!(f, "WantMassQuery: {}", u8::from(self.want_mass_query))?;
        writeln!(f, "Priority: {}", self.priority)
    }
}

pub struct BinaryCacheStore<B> {
    backend: B,
    cache_info: CacheInfo,
    compression: Option<String>,
    disk_cache: Option<Arc<NarInfoDiskCache>>,
}

impl<B: BinaryCacheBackend> BinaryCacheStore<B> {
    /// Opens the cache, reading its `nix-cache-info`. Writable backends
    /// without one get the default written.
    pub async fn open(backend: B) -> Result<Self, Error> {
        let cache_info = match backend.get_file(CACHE_INFO_FILE).await? {
            Some(data) => CacheInfo::parse(&String::from_utf8_lossy(&data))?,
            None => {
                let cache_info = CacheInfo::default();
                match backend
                    .upsert_file(
                        CACHE_INFO_FILE,
                        cache_info.to_string().into(),
                        "text/x-nix-cache-info",
                    )
                    .await
                {
                    Ok(()) | Err(Error::ReadOnly(_)) => {}
                    Err(e) => return Err(e),
                }
                cache_info
            }
        };

        if cache_info.store_dir != STORE_DIR {
            return Err(Error::InvalidRequest(format!(
                "binary cache '{}' is for Nix stores with prefix '{}', not '{}'",
                backend.uri(),
                cache_info.store_dir,
                STORE_DIR
            )));
        }

        Ok(Self {
            backend,
            cache_info,
            compression: Some("xz".to_string()),
            disk_cache: None,
        })
    }

    /// Sets the compression NARs are written with, `none` or None for no
    /// compression.
    pub fn with_compression(mut self, compression: Option<&str>) -> Result<Self, Error> {
        if !compression.map_or(true, |c| compression::SUPPORTED.contains(&c)) {
            return Err(Error::InvalidRequest(format!(
                "unsupported compression: {compression:?}"
            )));
        }
        self.compression = match compression {
            None | Some("none") => None,
            Some(c) => Some(c.to_string()),
        };
        Ok(self)
    }

    /// Routes narinfo lookups through `disk_cache`, registering this cache
    /// in it.
    pub async fn with_disk_cache(mut self, disk_cache: Arc<NarInfoDiskCache>) -> Result<Self, Error> {
        disk_cache
            .create_cache(&self.backend.uri(), &self.cache_info)
            .await?;
        self.disk_cache = Some(disk_cache);
        Ok(self)
    }

    pub fn cache_info(&self) -> &CacheInfo {
        &self.cache_info
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Fetches and parses the narinfo of `path`, bypassing the disk cache.
    #[instrument(skip_all, fields(path = %path), err)]
    pub async fn query_path_info_uncached(&self, path: &StorePath) -> Result<Option<NarInfo>, Error> {
        let Some(data) = self.backend.get_file(&narinfo_file_name(path)).await? else {
            debug!("narinfo not found");
            return Ok(None);
        };

        let narinfo = NarInfo::parse(&String::from_utf8_lossy(&data)).map_err(|e| {
            Error::StorageError(format!("narinfo for '{}' is corrupt: {e}", path.to_absolute_path()))
        })?;
        if narinfo.store_path != *path {
            return Err(Error::StorageError(format!(
                "narinfo for '{}' describes '{}'",
                path.to_absolute_path(),
                narinfo.store_path.to_absolute_path()
            )));
        }
        Ok(Some(narinfo))
    }

    /// Like [Self::query_path_info_uncached], answering from the disk cache
    /// when it knows about the path.
    pub async fn query_narinfo(&self, path: &StorePath) -> Result<Option<NarInfo>, Error> {
        let uri = self.backend.uri();
        let hash_part = path.hash_part();

        if let Some(disk_cache) = &self.disk_cache {
            match disk_cache.lookup_nar_info(&uri, &hash_part).await {
                Ok(NarInfoLookup::Valid(narinfo)) => return Ok(Some(*narinfo)),
                Ok(NarInfoLookup::Invalid) => return Ok(None),
                Ok(NarInfoLookup::Unknown) => {}
                Err(e) => warn!(err = %e, "narinfo disk cache lookup failed"),
            }
        }

        let narinfo = self.query_path_info_uncached(path).await?;
        self.remember(&hash_part, narinfo.as_ref()).await;
        Ok(narinfo)
    }

    async fn remember(&self, hash_part: &str, narinfo: Option<&NarInfo>) {
        if let Some(disk_cache) = &self.disk_cache {
            if let Err(e) = disk_cache
                .upsert_nar_info(&self.backend.uri(), hash_part, narinfo)
                .await
            {
                warn!(err = %e, "unable to update narinfo disk cache");
            }
        }
    }

    async fn upsert_narinfo(&self, narinfo: &NarInfo) -> Result<(), Error> {
        self.backend
            .upsert_file(
                &narinfo_file_name(&narinfo.store_path),
                narinfo.to_string().into(),
                "text/x-nix-narinfo",
            )
            .await?;
        self.remember(&narinfo.store_path.hash_part(), Some(narinfo))
            .await;
        Ok(())
    }

    /// Uploads a NAR and its narinfo. `nar` must match `info`, and all
    /// references other than the path itself must already be in the cache.
    #[instrument(skip_all, fields(path = %info.store_path), err)]
    pub async fn add_to_store(&self, info: PathInfo, nar: Bytes) -> Result<NarInfo, Error> {
        let got = <[u8; 32]>::from(Sha256::digest(&nar));
        if got != info.nar_sha256 || nar.len() as u64 != info.nar_size {
            return Err(Error::HashMismatch {
                path: info.store_path.to_absolute_path(),
                expected: NixHash::Sha256(info.nar_sha256).to_sri_string(),
                got: NixHash::Sha256(got).to_sri_string(),
            });
        }

        if let Some(existing) = self.query_path_info_uncached(&info.store_path).await? {
            debug!("already in cache");
            return Ok(existing);
        }

        for reference in &info.references {
            if reference != &info.store_path
                && !self.backend.file_exists(&narinfo_file_name(reference)).await?
            {
                return Err(Error::InvalidRequest(format!(
                    "cannot add '{}' to the binary cache because the reference '{}' is not valid",
                    info.store_path.to_absolute_path(),
                    reference.to_absolute_path()
                )));
            }
        }

        let compressed = compression::compress(self.compression.as_deref(), &nar).await?;
        let file_hash = <[u8; 32]>::from(Sha256::digest(&compressed));
        let extension = compression_extension(self.compression.as_deref()).unwrap_or_default();
        let url = nar_url(&file_hash, extension);
        let file_size = compressed.len() as u64;

        if !self.backend.file_exists(&url).await? {
            self.backend
                .upsert_file(&url, compressed.into(), "application/x-nix-nar")
                .await?;
        }

        let narinfo = info.to_narinfo(
            url,
            self.compression.clone(),
            Some(file_hash),
            Some(file_size),
        );
        self.upsert_narinfo(&narinfo).await?;

        info!(nar_size = info.nar_size, file_size, "uploaded path");
        Ok(narinfo)
    }

    async fn add_tree(&self, info: PathInfo, nar: Vec<u8>) -> Result<StorePath, Error> {
        let store_path = info.store_path.clone();
        self.add_to_store(info, nar.into()).await?;
        Ok(store_path)
    }
}

/// Serialises `src` in a blocking task, returning the NAR and its digest.
async fn dump(src: &Path, filter: Option<Arc<PathFilter>>) -> Result<(Vec<u8>, [u8; 32]), Error> {
    let src = src.to_path_buf();
    let nar =
        tokio::task::spawn_blocking(move || dump_path(&src, Vec::new(), filter.as_deref())).await??;
    let digest = Sha256::digest(&nar).into();
    Ok((nar, digest))
}

fn ca_info(name: &str, ca: CAHash, nar_sha256: [u8; 32], nar_size: u64) -> Result<PathInfo, Error> {
    let store_path = build_ca_path(name, &ca, Vec::<String>::new(), false)
        .map_err(|e| Error::InvalidRequest(format!("cannot add '{name}': {e}")))?;
    let mut info = PathInfo::new(store_path, nar_sha256, nar_size);
    info.ca = Some(ca);
    info.registration_time = now();
    Ok(info)
}

#[async_trait]
impl<B: BinaryCacheBackend> Store for BinaryCacheStore<B> {
    fn uri(&self) -> String {
        self.backend.uri()
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, Error> {
        Ok(self.query_narinfo(path).await?.as_ref().map(PathInfo::from))
    }

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, Error> {
        if let Some(disk_cache) = &self.disk_cache {
            match disk_cache
                .lookup_nar_info(&self.backend.uri(), &path.hash_part())
                .await
            {
                Ok(NarInfoLookup::Valid(_)) => return Ok(true),
                Ok(NarInfoLookup::Invalid) => return Ok(false),
                Ok(NarInfoLookup::Unknown) => {}
                Err(e) => warn!(err = %e, "narinfo disk cache lookup failed"),
            }
        }
        self.backend.file_exists(&narinfo_file_name(path)).await
    }

    #[instrument(skip_all, fields(path = %path), err)]
    async fn nar_from_path(&self, path: &StorePath) -> Result<Bytes, Error> {
        let narinfo = self
            .query_narinfo(path)
            .await?
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;

        let data = self.backend.get_file(&narinfo.url).await?.ok_or_else(|| {
            Error::StorageError(format!(
                "NAR file {} of '{}' is missing",
                narinfo.url,
                path.to_absolute_path()
            ))
        })?;

        let nar = compression::decompress(narinfo.compression.as_deref(), &data).await?;
        let got = <[u8; 32]>::from(Sha256::digest(&nar));
        if got != narinfo.nar_hash {
            return Err(Error::HashMismatch {
                path: path.to_absolute_path(),
                expected: NixHash::Sha256(narinfo.nar_hash).to_sri_string(),
                got: NixHash::Sha256(got).to_sri_string(),
            });
        }
        Ok(nar.into())
    }

    async fn add_to_store_recursive(
        &self,
        name: &str,
        src: &Path,
        filter: Option<Arc<PathFilter>>,
    ) -> Result<StorePath, Error> {
        let (nar, nar_sha256) = dump(src, filter).await?;
        let info = ca_info(
            name,
            CAHash::Nar(NixHash::Sha256(nar_sha256)),
            nar_sha256,
            nar.len() as u64,
        )?;
        self.add_tree(info, nar).await
    }

    async fn add_to_store_flat(&self, name: &str, src: &Path) -> Result<StorePath, Error> {
        let contents = tokio::fs::read(src).await?;
        let flat_sha256 = Sha256::digest(&contents).into();
        let (nar, nar_sha256) = dump(src, None).await?;
        let info = ca_info(
            name,
            CAHash::Flat(NixHash::Sha256(flat_sha256)),
            nar_sha256,
            nar.len() as u64,
        )?;
        self.add_tree(info, nar).await
    }

    async fn add_signatures(&self, path: &StorePath, sigs: Vec<Signature>) -> Result<(), Error> {
        let mut narinfo = self
            .query_path_info_uncached(path)
            .await?
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;

        if narinfo.add_signatures(sigs) > 0 {
            self.upsert_narinfo(&narinfo).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
