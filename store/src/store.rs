use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use ferrix_compat::{narinfo::Signature, store_path::StorePath};

use crate::{nar::PathFilter, Error, PathInfo};

/// The operations every store supports.
///
/// Paths are added by content: [Store::add_to_store_recursive] and
/// [Store::add_to_store_flat] compute the content address of what they're
/// given and return the resulting [StorePath], which is identical across
/// stores for identical contents.
#[async_trait]
pub trait Store: Send + Sync {
    /// Identifies the store in logs and as the narinfo disk cache key.
    fn uri(&self) -> String;

    /// Looks up the metadata of a path, returning None if it's not valid in
    /// this store.
    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, Error>;

    async fn is_valid_path(&self, path: &StorePath) -> Result<bool, Error> {
        Ok(self.query_path_info(path).await?.is_some())
    }

    /// Returns the (uncompressed) NAR serialisation of a valid path.
    async fn nar_from_path(&self, path: &StorePath) -> Result<Bytes, Error>;

    /// Adds the tree at `src` as a recursive sha256 content-addressed path.
    async fn add_to_store_recursive(
        &self,
        name: &str,
        src: &Path,
        filter: Option<Arc<PathFilter>>,
    ) -> Result<StorePath, Error>;

    /// Adds the regular file at `src` as a flat sha256 content-addressed path.
    async fn add_to_store_flat(&self, name: &str, src: &Path) -> Result<StorePath, Error>;

    /// Adds signatures to a valid path. Existing signatures are kept.
    async fn add_signatures(&self, path: &StorePath, sigs: Vec<Signature>) -> Result<(), Error>;

    /// Where the contents of a path can be read on the local filesystem, if
    /// this store keeps them there.
    fn real_path(&self, _path: &StorePath) -> Option<PathBuf> {
        None
    }
}
