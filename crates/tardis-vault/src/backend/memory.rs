//! In-memory blob backend.

use super::validate_key;
use std::collections::BTreeMap;
use std::sync::Arc;
use tardis_types::{BlobMetadata, StorageBackend, StorageError};
use tokio::sync::RwLock;

/// Keeps blobs and metadata in a map for the process lifetime.
pub struct InMemoryBackend {
    blobs: Arc<RwLock<BTreeMap<String, (Vec<u8>, BlobMetadata)>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            blobs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for InMemoryBackend {
    async fn put(&self, key: &str, data: &[u8], metadata: &BlobMetadata) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs
            .write()
            .await
            .insert(key.to_string(), (data.to_vec(), metadata.clone()));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMetadata)>, StorageError> {
        validate_key(key)?;
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn metadata(&self, key: &str) -> Result<Option<BlobMetadata>, StorageError> {
        validate_key(key)?;
        Ok(self.blobs.read().await.get(key).map(|(_, m)| m.clone()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.blobs.write().await.remove(key).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.blobs.read().await.keys().cloned().collect())
    }
}
