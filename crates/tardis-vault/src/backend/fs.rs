//! Filesystem blob backend: `<root>/<key>.bin` plus a `<root>/<key>.meta.json` sidecar.

use super::validate_key;
use std::path::{Path, PathBuf};
use tardis_types::{BlobMetadata, StorageBackend, StorageError};

const BLOB_EXT: &str = ".bin";
const META_EXT: &str = ".meta.json";

pub struct FileSystemBackend {
    root: PathBuf,
}

impl FileSystemBackend {
    /// Use `root` as the blob directory, creating it if needed.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    fn blob_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{}", key, BLOB_EXT))
    }

    fn meta_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{}{}", key, META_EXT))
    }

    async fn read_opt(path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match tokio::fs::read(path).await {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_opt(path: &Path) -> Result<bool, StorageError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn parse_meta(key: &str, bytes: &[u8]) -> Result<BlobMetadata, StorageError> {
        serde_json::from_slice(bytes)
            .map_err(|e| StorageError::Other(format!("corrupt metadata for {}: {}", key, e)))
    }
}

#[async_trait::async_trait]
impl StorageBackend for FileSystemBackend {
    async fn put(&self, key: &str, data: &[u8], metadata: &BlobMetadata) -> Result<(), StorageError> {
        validate_key(key)?;
        let meta = serde_json::to_vec_pretty(metadata)
            .map_err(|e| StorageError::Other(e.to_string()))?;
        tokio::fs::write(self.blob_path(key), data).await?;
        tokio::fs::write(self.meta_path(key), meta).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, BlobMetadata)>, StorageError> {
        validate_key(key)?;
        let Some(meta) = Self::read_opt(&self.meta_path(key)).await? else {
            return Ok(None);
        };
        let Some(data) = Self::read_opt(&self.blob_path(key)).await? else {
            return Err(StorageError::Other(format!("blob missing for {}", key)));
        };
        Ok(Some((data, Self::parse_meta(key, &meta)?)))
    }

    async fn metadata(&self, key: &str) -> Result<Option<BlobMetadata>, StorageError> {
        validate_key(key)?;
        match Self::read_opt(&self.meta_path(key)).await? {
            Some(bytes) => Ok(Some(Self::parse_meta(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        let had_meta = Self::remove_opt(&self.meta_path(key)).await?;
        let had_blob = Self::remove_opt(&self.blob_path(key)).await?;
        Ok(had_meta || had_blob)
    }

    async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(key) = name.to_str().and_then(|n| n.strip_suffix(META_EXT)) {
                out.push(key.to_string());
            }
        }
        out.sort();
        Ok(out)
    }
}
