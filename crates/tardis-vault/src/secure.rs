//! SecureDataManager: encrypts blobs under the key ring, enforces read access,
//! and re-encrypts everything on key rotation.

use crate::crypto::{checksum, KeyRing};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tardis_types::{
    advance_timestamp, can_mutate, new_id, now, BlobMetadata, StorageBackend, StorageError,
};
use tokio::sync::RwLock;

/// Optional attributes for a stored blob.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreOptions {
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Outcome of a key-rotation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RotationReport {
    pub new_key_id: String,
    pub migrated: usize,
    /// `(blob id, error)` for every blob that could not be re-encrypted.
    pub failed: Vec<(String, String)>,
    /// Key ids dropped from the ring after a clean pass.
    pub retired: Vec<String>,
}

pub struct SecureDataManager {
    backend: Arc<dyn StorageBackend>,
    keyring: RwLock<KeyRing>,
}

impl SecureDataManager {
    pub fn new(backend: Arc<dyn StorageBackend>, keyring: KeyRing) -> Self {
        Self {
            backend,
            keyring: RwLock::new(keyring),
        }
    }

    /// Build a manager over blobs that may already exist: every key id found in
    /// their metadata is re-derived and the newest becomes current. Ring keys
    /// no stored blob uses are retired, matching the state after a clean rotation.
    pub async fn open(
        backend: Arc<dyn StorageBackend>,
        mut keyring: KeyRing,
    ) -> Result<Self, StorageError> {
        let mut in_use = BTreeSet::new();
        for key in backend.list().await? {
            if let Some(metadata) = backend.metadata(&key).await? {
                in_use.insert(metadata.key_id);
            }
        }
        for id in &in_use {
            keyring.restore(id)?;
        }
        let current = keyring.current_id();
        for id in keyring.key_ids() {
            if id != current && !in_use.contains(&id) {
                keyring.retire(&id);
            }
        }
        tracing::info!(
            current_key_id = %current,
            keys = in_use.len(),
            "secure storage opened"
        );
        Ok(Self::new(backend, keyring))
    }

    pub async fn current_key_id(&self) -> String {
        self.keyring.read().await.current_id()
    }

    /// Encrypt and store `data` for `owner`; returns the new blob id.
    pub async fn store(
        &self,
        owner: &str,
        data: &[u8],
        opts: StoreOptions,
    ) -> Result<String, StorageError> {
        if owner.is_empty() {
            return Err(StorageError::Other("owner must not be empty".to_string()));
        }
        let id = new_id();
        let ring = self.keyring.read().await;
        let (key_id, sealed) = ring.encrypt(data)?;
        let ts = now();
        let metadata = BlobMetadata {
            owner: owner.to_string(),
            content_type: opts
                .content_type
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            key_id,
            checksum: checksum(data),
            size: data.len() as u64,
            allowed_users: opts.allowed_users,
            tags: opts.tags,
            created_at: ts,
            updated_at: ts,
        };
        self.backend.put(&id, &sealed, &metadata).await?;
        tracing::info!(id = %id, owner = %owner, size = data.len(), "secure blob stored");
        Ok(id)
    }

    /// Decrypt a blob for `requester` (owner, system, or an allowed user).
    pub async fn retrieve(&self, id: &str, requester: &str) -> Result<Vec<u8>, StorageError> {
        let (sealed, metadata) = self
            .backend
            .get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if !metadata.can_read(requester) {
            tracing::warn!(id = %id, requester = %requester, "secure blob access denied");
            return Err(StorageError::AccessDenied(format!("{} on {}", requester, id)));
        }
        let plaintext = self.keyring.read().await.decrypt(&metadata.key_id, &sealed)?;
        if checksum(&plaintext) != metadata.checksum {
            return Err(StorageError::Integrity(id.to_string()));
        }
        Ok(plaintext)
    }

    pub async fn metadata(&self, id: &str, requester: &str) -> Result<BlobMetadata, StorageError> {
        let metadata = self
            .backend
            .metadata(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if !metadata.can_read(requester) {
            return Err(StorageError::AccessDenied(format!("{} on {}", requester, id)));
        }
        Ok(metadata)
    }

    async fn owned_entry(
        &self,
        id: &str,
        actor: &str,
    ) -> Result<(Vec<u8>, BlobMetadata), StorageError> {
        let (sealed, metadata) = self
            .backend
            .get(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        if !can_mutate(&metadata.owner, actor) {
            return Err(StorageError::AccessDenied(format!("{} on {}", actor, id)));
        }
        Ok((sealed, metadata))
    }

    pub async fn grant_access(&self, id: &str, actor: &str, user: &str) -> Result<BlobMetadata, StorageError> {
        let (sealed, mut metadata) = self.owned_entry(id, actor).await?;
        if !metadata.allowed_users.iter().any(|u| u == user) {
            metadata.allowed_users.push(user.to_string());
        }
        metadata.updated_at = advance_timestamp(metadata.updated_at);
        self.backend.put(id, &sealed, &metadata).await?;
        Ok(metadata)
    }

    pub async fn revoke_access(&self, id: &str, actor: &str, user: &str) -> Result<BlobMetadata, StorageError> {
        let (sealed, mut metadata) = self.owned_entry(id, actor).await?;
        metadata.allowed_users.retain(|u| u != user);
        metadata.updated_at = advance_timestamp(metadata.updated_at);
        self.backend.put(id, &sealed, &metadata).await?;
        Ok(metadata)
    }

    pub async fn delete(&self, id: &str, actor: &str) -> Result<(), StorageError> {
        self.owned_entry(id, actor).await?;
        self.backend.delete(id).await?;
        tracing::info!(id = %id, actor = %actor, "secure blob deleted");
        Ok(())
    }

    /// Blobs `user` may read, sorted by id.
    pub async fn list_for(&self, user: &str) -> Result<Vec<(String, BlobMetadata)>, StorageError> {
        let mut out = Vec::new();
        for key in self.backend.list().await? {
            if let Some(metadata) = self.backend.metadata(&key).await? {
                if metadata.can_read(user) {
                    out.push((key, metadata));
                }
            }
        }
        Ok(out)
    }

    /// Generate a new key and re-encrypt every blob under it, one at a time.
    /// Per-blob failures are reported and do not stop the pass; older keys are
    /// retired only when nothing failed.
    pub async fn rotate_keys(&self) -> Result<RotationReport, StorageError> {
        let mut ring = self.keyring.write().await;
        let new_key_id = ring.rotate();
        let mut report = RotationReport {
            new_key_id: new_key_id.clone(),
            ..Default::default()
        };

        for key in self.backend.list().await? {
            let migrated: Result<bool, StorageError> = async {
                let Some((sealed, mut metadata)) = self.backend.get(&key).await? else {
                    return Ok(false);
                };
                if metadata.key_id == new_key_id {
                    return Ok(false);
                }
                let plaintext = ring.decrypt(&metadata.key_id, &sealed)?;
                let (key_id, resealed) = ring.encrypt(&plaintext)?;
                metadata.key_id = key_id;
                metadata.updated_at = advance_timestamp(metadata.updated_at);
                self.backend.put(&key, &resealed, &metadata).await?;
                Ok(true)
            }
            .await;
            match migrated {
                Ok(true) => report.migrated += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(id = %key, error = %e, "re-encryption failed");
                    report.failed.push((key, e.to_string()));
                }
            }
        }

        if report.failed.is_empty() {
            for id in ring.key_ids() {
                if id != new_key_id && ring.retire(&id) {
                    report.retired.push(id);
                }
            }
        }
        tracing::info!(
            new_key_id = %new_key_id,
            migrated = report.migrated,
            failed = report.failed.len(),
            "key rotation finished"
        );
        Ok(report)
    }
}
