//! A store keeping its objects in a plain directory.
//!
//! Objects live at `<root>/<hash>-<name>`, their metadata as JSON in
//! `<root>/.meta/<hash>.json`. An object without metadata is not valid, and
//! is replaced the next time the same path is added.

use std::{
    fs, io,
    io::Write,
    os::unix::fs::{symlink, PermissionsExt},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use ferrix_compat::{
    narinfo::Signature,
    nixhash::{CAHash, NixHash},
    store_path::{build_ca_path, StorePath},
};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    nar::{dump_path, nar_hash_path, PathFilter},
    utils::now,
    Error, PathInfo, Store,
};

const META_DIR: &str = ".meta";

pub struct LocalStore {
    root: PathBuf,
    meta_dir: PathBuf,
    /// Held across metadata read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl LocalStore {
    /// Opens (and creates, if needed) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let meta_dir = root.join(META_DIR);
        tokio::fs::create_dir_all(&meta_dir).await?;

        Ok(Self {
            root,
            meta_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn object_path(&self, path: &StorePath) -> PathBuf {
        self.root.join(path.to_string())
    }

    fn meta_path(&self, path: &StorePath) -> PathBuf {
        self.meta_dir.join(format!("{}.json", path.hash_part()))
    }

    async fn read_info(&self, path: &StorePath) -> Result<Option<PathInfo>, Error> {
        let bytes = match tokio::fs::read(self.meta_path(path)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let info: PathInfo = serde_json::from_slice(&bytes)?;
        if info.store_path != *path {
            warn!(path = %path, found = %info.store_path, "metadata belongs to another path");
            return Ok(None);
        }
        Ok(Some(info))
    }

    async fn write_info(&self, info: &PathInfo) -> Result<(), Error> {
        let json = serde_json::to_vec_pretty(info)?;
        let meta_dir = self.meta_dir.clone();
        let dest = self.meta_path(&info.store_path);

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&meta_dir)?;
            tmp.write_all(&json)?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    /// Materialises an object through `materialise`, checks its NAR hash
    /// against `info` and registers it.
    async fn add_object<F>(&self, info: PathInfo, materialise: F) -> Result<StorePath, Error>
    where
        F: FnOnce(&Path) -> io::Result<()> + Send + 'static,
    {
        let _guard = self.write_lock.lock().await;
        let store_path = info.store_path.clone();

        if self.read_info(&store_path).await?.is_some() {
            debug!(path = %store_path, "already valid");
            return Ok(store_path);
        }

        let root = self.root.clone();
        let dest = self.object_path(&store_path);
        let expected = (info.nar_sha256, info.nar_size);

        tokio::task::spawn_blocking(move || -> Result<(), Error> {
            let tmp = tempfile::Builder::new().prefix(".tmp-").tempdir_in(&root)?;
            let staged = tmp.path().join("object");
            materialise(&staged)?;

            let got = nar_hash_path(&staged, None)?;
            if got != expected {
                return Err(Error::HashMismatch {
                    path: dest.display().to_string(),
                    expected: NixHash::Sha256(expected.0).to_sri_string(),
                    got: NixHash::Sha256(got.0).to_sri_string(),
                });
            }

            canonicalise(&staged)?;
            if let Ok(metadata) = fs::symlink_metadata(&dest) {
                warn!(path = %dest.display(), "replacing unregistered object");
                if metadata.is_dir() {
                    fs::remove_dir_all(&dest)?;
                } else {
                    fs::remove_file(&dest)?;
                }
            }
            fs::rename(&staged, &dest)?;
            Ok(())
        })
        .await??;

        self.write_info(&info).await?;
        info!(path = %store_path, nar_size = info.nar_size, "added path");
        Ok(store_path)
    }
}

fn copy_tree(src: &Path, dst: &Path, filter: Option<&PathFilter>) -> io::Result<()> {
    let metadata = fs::symlink_metadata(src)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        symlink(fs::read_link(src)?, dst)
    } else if file_type.is_file() {
        fs::copy(src, dst).map(|_| ())
    } else if file_type.is_dir() {
        fs::create_dir(dst)?;
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            let child = entry.path();
            if filter.map_or(true, |f| f(&child)) {
                copy_tree(&child, &dst.join(entry.file_name()), filter)?;
            }
        }
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported file type at {}", src.display()),
        ))
    }
}

/// Drops write permissions on files and resets all mtimes to 1.
fn canonicalise(path: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(path)?;
    let epoch = FileTime::from_unix_time(1, 0);

    if metadata.is_dir() {
        for entry in fs::read_dir(path)? {
            canonicalise(&entry?.path())?;
        }
    } else if metadata.is_file() {
        let mode = if metadata.permissions().mode() & 0o100 != 0 {
            0o555
        } else {
            0o444
        };
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }

    filetime::set_symlink_file_times(path, epoch, epoch)
}

fn ca_store_path(name: &str, ca: &CAHash) -> Result<StorePath, Error> {
    build_ca_path(name, ca, Vec::<String>::new(), false)
        .map_err(|e| Error::InvalidRequest(format!("cannot add '{name}': {e}")))
}

#[async_trait]
impl Store for LocalStore {
    fn uri(&self) -> String {
        format!("local?root={}", self.root.display())
    }

    async fn query_path_info(&self, path: &StorePath) -> Result<Option<PathInfo>, Error> {
        match self.read_info(path).await? {
            Some(info) if tokio::fs::symlink_metadata(self.object_path(path)).await.is_ok() => {
                Ok(Some(info))
            }
            Some(_) => {
                warn!(path = %path, "metadata without object");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn nar_from_path(&self, path: &StorePath) -> Result<Bytes, Error> {
        if !self.is_valid_path(path).await? {
            return Err(Error::InvalidPath(path.clone()));
        }

        let object = self.object_path(path);
        let nar = tokio::task::spawn_blocking(move || dump_path(&object, Vec::new(), None)).await??;
        Ok(nar.into())
    }

    #[instrument(skip_all, fields(name = %name, src = %src.display()), err)]
    async fn add_to_store_recursive(
        &self,
        name: &str,
        src: &Path,
        filter: Option<Arc<PathFilter>>,
    ) -> Result<StorePath, Error> {
        let (nar_sha256, nar_size) = tokio::task::spawn_blocking({
            let src = src.to_path_buf();
            let filter = filter.clone();
            move || nar_hash_path(&src, filter.as_deref())
        })
        .await??;

        let ca = CAHash::Nar(NixHash::Sha256(nar_sha256));
        let mut info = PathInfo::new(ca_store_path(name, &ca)?, nar_sha256, nar_size);
        info.ca = Some(ca);
        info.registration_time = now();

        let src = src.to_path_buf();
        self.add_object(info, move |dst| copy_tree(&src, dst, filter.as_deref()))
            .await
    }

    #[instrument(skip_all, fields(name = %name, src = %src.display()), err)]
    async fn add_to_store_flat(&self, name: &str, src: &Path) -> Result<StorePath, Error> {
        let (flat_sha256, (nar_sha256, nar_size)) = tokio::task::spawn_blocking({
            let src = src.to_path_buf();
            move || -> io::Result<_> {
                if !fs::symlink_metadata(&src)?.is_file() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is not a regular file", src.display()),
                    ));
                }
                let mut hasher = Sha256::new();
                io::copy(&mut fs::File::open(&src)?, &mut hasher)?;
                Ok((hasher.finalize().into(), nar_hash_path(&src, None)?))
            }
        })
        .await??;

        let ca = CAHash::Flat(NixHash::Sha256(flat_sha256));
        let mut info = PathInfo::new(ca_store_path(name, &ca)?, nar_sha256, nar_size);
        info.ca = Some(ca);
        info.registration_time = now();

        let src = src.to_path_buf();
        self.add_object(info, move |dst| fs::copy(&src, dst).map(|_| ()))
            .await
    }

    async fn add_signatures(&self, path: &StorePath, sigs: Vec<Signature>) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut info = self
            .read_info(path)
            .await?
            .ok_or_else(|| Error::InvalidPath(path.clone()))?;

        if info.add_signatures(sigs) > 0 {
            self.write_info(&info).await?;
        }
        Ok(())
    }

    fn real_path(&self, path: &StorePath) -> Option<PathBuf> {
        Some(self.object_path(path))
    }
}
