use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::BinaryCacheBackend;
use crate::Error;

/// Keeps all files in memory. Mostly useful in tests.
#[derive(Default)]
pub struct MemoryBinaryCache {
    files: RwLock<HashMap<String, Bytes>>,
}

#[async_trait]
impl BinaryCacheBackend for MemoryBinaryCache {
    fn uri(&self) -> String {
        "memory://".to_string()
    }

    async fn file_exists(&self, path: &str) -> Result<bool, Error> {
        Ok(self.files.read().await.contains_key(path))
    }

    async fn upsert_file(&self, path: &str, data: Bytes, _mime_type: &str) -> Result<(), Error> {
        self.files.write().await.insert(path.to_string(), data);
        Ok(())
    }

    async fn get_file(&self, path: &str) -> Result<Option<Bytes>, Error> {
        Ok(self.files.read().await.get(path).cloned())
    }
}
