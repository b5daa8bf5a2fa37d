use std::{
    io::{self, Write},
    path::PathBuf,
};

use async_trait::async_trait;
use bytes::Bytes;

use super::BinaryCacheBackend;
use crate::Error;

/// A binary cache in a local directory, laid out like one served over HTTP.
pub struct LocalBinaryCache {
    root: PathBuf,
}

impl LocalBinaryCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, Error> {
        if path.split('/').any(|c| c.is_empty() || c == "." || c == "..") {
            return Err(Error::InvalidRequest(format!("invalid cache file name: {path}")));
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BinaryCacheBackend for LocalBinaryCache {
    fn uri(&self) -> String {
        format!("file://{}", self.root.display())
    }

    async fn file_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn upsert_file(&self, path: &str, data: Bytes, _mime_type: &str) -> Result<(), Error> {
        let dest = self.resolve(path)?;

        tokio::task::spawn_blocking(move || -> io::Result<()> {
            let parent = dest
                .parent()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no parent"))?;
            std::fs::create_dir_all(parent)?;

            let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
            tmp.write_all(&data)?;
            tmp.persist(&dest).map_err(|e| e.error)?;
            Ok(())
        })
        .await??;
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<Bytes>, Error> {
        match tokio::fs::read(self.resolve(path)?).await {
            Ok(data) => Ok(Some(data.into())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LocalBinaryCache;
    use crate::binary_cache::BinaryCacheBackend;

    #[tokio::test]
    async fn files() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalBinaryCache::new(dir.path());

        assert!(!cache.file_exists("nar/x.nar").await.unwrap());
        assert!(cache.get_file("nar/x.nar").await.unwrap().is_none());

        cache
            .upsert_file("nar/x.nar", "first".into(), "application/x-nix-nar")
            .await
            .unwrap();
        cache
            .upsert_file("nar/x.nar", "second".into(), "application/x-nix-nar")
            .await
            .unwrap();

        assert!(cache.file_exists("nar/x.nar").await.unwrap());
        assert_eq!(
            Some("second".into()),
            cache.get_file("nar/x.nar").await.unwrap()
        );
        assert!(dir.path().join("nar/x.nar").is_file());
    }

    #[tokio::test]
    async fn rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalBinaryCache::new(dir.path());
        cache.get_file("../etc/passwd").await.expect_err("must fail");
        cache.get_file("/etc/passwd").await.expect_err("must fail");
    }
}
