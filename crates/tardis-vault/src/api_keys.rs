//! API key store: one JSON file per key, secrets sealed under the key ring.

use crate::crypto::KeyRing;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tardis_types::{
    advance_timestamp, can_mutate, expiry_after, new_id, now, ApiKeyError, ApiKeyRecord, AuditEntry, KeyFilter,
    KeyStatus, NewApiKey,
};

pub struct ApiKeyManager {
    dir: PathBuf,
    keyring: KeyRing,
    write_lock: tokio::sync::Mutex<()>,
}

fn key_prefix(secret: &str) -> String {
    let head: String = secret.chars().take(4).collect();
    format!("{}…", head)
}

impl ApiKeyManager {
    /// Store key files under `dir`, creating it if needed.
    pub async fn new(dir: impl AsRef<Path>, keyring: KeyRing) -> Result<Self, ApiKeyError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            keyring,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn path_for(&self, id: &str) -> Result<PathBuf, ApiKeyError> {
        let ok = !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit() || c == '-');
        if !ok {
            return Err(ApiKeyError::NotFound(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }

    async fn load(&self, id: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        let path = self.path_for(id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ApiKeyError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| ApiKeyError::Io(format!("corrupt key file {}: {}", id, e)))
    }

    async fn save(&self, record: &ApiKeyRecord) -> Result<(), ApiKeyError> {
        let path = self.path_for(&record.id)?;
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record).map_err(|e| ApiKeyError::Io(e.to_string()))?;
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Load, mutate and persist one record under the write lock.
    async fn modify<F>(&self, id: &str, f: F) -> Result<ApiKeyRecord, ApiKeyError>
    where
        F: FnOnce(&mut ApiKeyRecord) -> Result<(), ApiKeyError>,
    {
        let _guard = self.write_lock.lock().await;
        let mut record = self.load(id).await?;
        f(&mut record)?;
        record.updated_at = advance_timestamp(record.updated_at);
        self.save(&record).await?;
        Ok(record)
    }

    fn ensure_active(record: &ApiKeyRecord, at: DateTime<Utc>) -> Result<(), ApiKeyError> {
        match record.effective_status(at) {
            KeyStatus::Active => Ok(()),
            status => Err(ApiKeyError::Inactive {
                id: record.id.clone(),
                status,
            }),
        }
    }

    fn ensure_owner(record: &ApiKeyRecord, actor: &str) -> Result<(), ApiKeyError> {
        if can_mutate(&record.owner, actor) {
            Ok(())
        } else {
            Err(ApiKeyError::PermissionDenied(format!(
                "{} on key {}",
                actor, record.id
            )))
        }
    }

    pub async fn create_key(&self, input: NewApiKey) -> Result<ApiKeyRecord, ApiKeyError> {
        if input.secret.trim().is_empty() {
            return Err(ApiKeyError::Invalid("secret must not be empty".to_string()));
        }
        if input.owner.trim().is_empty() || input.name.trim().is_empty() {
            return Err(ApiKeyError::Invalid("name and owner are required".to_string()));
        }
        let ts = now();
        let expires_at = match input.ttl_secs {
            Some(ttl) => Some(expiry_after(ts, ttl).ok_or_else(|| {
                ApiKeyError::Invalid(format!("ttl_secs out of range: {}", ttl))
            })?),
            None => None,
        };
        let (key_id, encrypted_key) = self.keyring.encrypt_to_string(input.secret.as_bytes())?;
        let record = ApiKeyRecord {
            id: new_id(),
            name: input.name,
            owner: input.owner.clone(),
            provider: input.provider,
            encrypted_key,
            key_id,
            key_prefix: key_prefix(&input.secret),
            scopes: input.scopes,
            status: KeyStatus::Active,
            metadata: input.metadata,
            usage_count: 0,
            last_used_at: None,
            expires_at,
            created_at: ts,
            updated_at: ts,
            rotation_history: vec![AuditEntry::new("created", input.owner)],
        };
        let _guard = self.write_lock.lock().await;
        self.save(&record).await?;
        tracing::info!(id = %record.id, provider = %record.provider, "api key created");
        Ok(record)
    }

    pub async fn get_key(&self, id: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        self.load(id).await
    }

    /// Matching keys, newest first. The status filter uses the effective status.
    pub async fn list_keys(&self, filter: &KeyFilter) -> Result<Vec<ApiKeyRecord>, ApiKeyError> {
        let at = now();
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            match self.load(id).await {
                Ok(record) if filter.matches(&record, at) => out.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(file = ?name, error = %e, "skipping unreadable key file"),
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    /// Decrypt the secret. Owner or system only; the key must be active.
    pub async fn reveal_key(&self, id: &str, actor: &str) -> Result<String, ApiKeyError> {
        let record = self.load(id).await?;
        Self::ensure_owner(&record, actor)?;
        Self::ensure_active(&record, now())?;
        let plain = self
            .keyring
            .decrypt_from_string(&record.key_id, &record.encrypted_key)?;
        String::from_utf8(plain).map_err(|e| ApiKeyError::Invalid(e.to_string()))
    }

    /// Count one use of an active key.
    pub async fn record_usage(&self, id: &str) -> Result<ApiKeyRecord, ApiKeyError> {
        self.modify(id, |record| {
            let at = now();
            Self::ensure_active(record, at)?;
            record.usage_count += 1;
            record.last_used_at = Some(at);
            Ok(())
        })
        .await
    }

    /// Replace the secret, keeping id and usage counters.
    pub async fn rotate_key(
        &self,
        id: &str,
        new_secret: &str,
        actor: &str,
    ) -> Result<ApiKeyRecord, ApiKeyError> {
        if new_secret.trim().is_empty() {
            return Err(ApiKeyError::Invalid("secret must not be empty".to_string()));
        }
        let (key_id, encrypted_key) = self.keyring.encrypt_to_string(new_secret.as_bytes())?;
        let record = self
            .modify(id, |record| {
                Self::ensure_owner(record, actor)?;
                if record.status == KeyStatus::Revoked {
                    return Err(ApiKeyError::Inactive {
                        id: record.id.clone(),
                        status: KeyStatus::Revoked,
                    });
                }
                let previous = std::mem::replace(&mut record.key_prefix, key_prefix(new_secret));
                record.encrypted_key = encrypted_key;
                record.key_id = key_id;
                record
                    .rotation_history
                    .push(AuditEntry::new("rotated", actor).with_details(format!("previous {}", previous)));
                Ok(())
            })
            .await?;
        tracing::info!(id = %id, actor = %actor, "api key rotated");
        Ok(record)
    }

    pub async fn revoke_key(
        &self,
        id: &str,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<ApiKeyRecord, ApiKeyError> {
        let record = self
            .modify(id, |record| {
                Self::ensure_owner(record, actor)?;
                record.status = KeyStatus::Revoked;
                let mut entry = AuditEntry::new("revoked", actor);
                if let Some(reason) = reason {
                    entry = entry.with_details(reason);
                }
                record.rotation_history.push(entry);
                Ok(())
            })
            .await?;
        tracing::info!(id = %id, actor = %actor, "api key revoked");
        Ok(record)
    }

    pub async fn delete_key(&self, id: &str, actor: &str) -> Result<(), ApiKeyError> {
        let _guard = self.write_lock.lock().await;
        let record = self.load(id).await?;
        Self::ensure_owner(&record, actor)?;
        tokio::fs::remove_file(self.path_for(id)?).await?;
        tracing::info!(id = %id, actor = %actor, "api key deleted");
        Ok(())
    }

    /// Persist `expired` on every key whose `expires_at` has passed; returns how many changed.
    pub async fn sweep_expired(&self) -> Result<usize, ApiKeyError> {
        let at = now();
        let candidates = self
            .list_keys(&KeyFilter {
                status: Some(KeyStatus::Expired),
                ..Default::default()
            })
            .await?;
        let mut changed = 0;
        for record in candidates.into_iter().filter(|r| r.status == KeyStatus::Active) {
            self.modify(&record.id, |r| {
                r.status = KeyStatus::Expired;
                r.rotation_history
                    .push(AuditEntry::new("expired", tardis_types::SYSTEM_ACTOR));
                Ok(())
            })
            .await?;
            changed += 1;
        }
        if changed > 0 {
            tracing::info!(changed, at = %at, "expired api keys swept");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tardis_types::{Metadata, SYSTEM_ACTOR};

    async fn manager(dir: &Path) -> ApiKeyManager {
        ApiKeyManager::new(dir.join("keys"), KeyRing::generate()).await.unwrap()
    }

    fn new_key(owner: &str, provider: &str, ttl_secs: Option<i64>) -> NewApiKey {
        NewApiKey {
            name: format!("{}-{}", owner, provider),
            owner: owner.to_string(),
            provider: provider.to_string(),
            secret: "tg-0123456789abcdef".to_string(),
            scopes: vec!["chat".to_string()],
            metadata: Metadata::new(),
            ttl_secs,
        }
    }

    #[tokio::test]
    async fn create_persists_encrypted_and_reveals_for_owner() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        let rec = m.create_key(new_key("alice", "together", None)).await.unwrap();
        assert_eq!(rec.key_prefix, "tg-0…");
        assert_eq!(rec.status, KeyStatus::Active);

        let on_disk = std::fs::read_to_string(dir.path().join("keys").join(format!("{}.json", rec.id))).unwrap();
        assert!(!on_disk.contains("0123456789abcdef"));

        assert_eq!(m.reveal_key(&rec.id, "alice").await.unwrap(), "tg-0123456789abcdef");
        assert!(matches!(
            m.reveal_key(&rec.id, "bob").await,
            Err(ApiKeyError::PermissionDenied(_))
        ));

        let got = m.get_key(&rec.id).await.unwrap();
        assert_eq!(got.name, rec.name);
        assert_eq!(got.created_at, rec.created_at);
    }

    #[tokio::test]
    async fn out_of_range_ttl_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        for ttl in [0, -1, i64::MAX] {
            assert!(matches!(
                m.create_key(new_key("alice", "together", Some(ttl))).await,
                Err(ApiKeyError::Invalid(_))
            ));
        }
        assert!(m.list_keys(&KeyFilter::default()).await.unwrap().is_empty());
    }

    #[test]
    fn prefix_is_first_four_chars() {
        assert_eq!(key_prefix("sk-live-abcdef"), "sk-l…");
        assert_eq!(key_prefix("abcd1"), "abcd…");
        assert_eq!(key_prefix("ab"), "ab…");
    }

    #[tokio::test]
    async fn usage_counts_and_advances_updated_at() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        let rec = m.create_key(new_key("alice", "together", None)).await.unwrap();
        let once = m.record_usage(&rec.id).await.unwrap();
        let twice = m.record_usage(&rec.id).await.unwrap();
        assert_eq!(twice.usage_count, 2);
        assert!(twice.last_used_at.is_some());
        assert!(once.updated_at > rec.updated_at);
        assert!(twice.updated_at > once.updated_at);
        assert_eq!(twice.id, rec.id);
        assert_eq!(twice.created_at, rec.created_at);
    }

    #[tokio::test]
    async fn expired_key_is_inactive_regardless_of_stored_status() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        let rec = m.create_key(new_key("alice", "together", Some(1))).await.unwrap();
        let mut stale = m.get_key(&rec.id).await.unwrap();
        stale.expires_at = Some(now() - Duration::seconds(5));
        m.save(&stale).await.unwrap();

        assert_eq!(m.get_key(&rec.id).await.unwrap().status, KeyStatus::Active);
        assert!(matches!(
            m.record_usage(&rec.id).await,
            Err(ApiKeyError::Inactive { status: KeyStatus::Expired, .. })
        ));
        assert!(m.reveal_key(&rec.id, "alice").await.is_err());

        assert_eq!(m.sweep_expired().await.unwrap(), 1);
        assert_eq!(m.get_key(&rec.id).await.unwrap().status, KeyStatus::Expired);
        assert_eq!(m.sweep_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rotate_then_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        let rec = m.create_key(new_key("alice", "together", None)).await.unwrap();
        let rotated = m.rotate_key(&rec.id, "tg-fedcba9876543210", "alice").await.unwrap();
        assert_eq!(rotated.rotation_history.len(), 2);
        assert_eq!(m.reveal_key(&rec.id, "alice").await.unwrap(), "tg-fedcba9876543210");

        let revoked = m.revoke_key(&rec.id, SYSTEM_ACTOR, Some("leaked")).await.unwrap();
        assert_eq!(revoked.status, KeyStatus::Revoked);
        assert!(matches!(
            m.rotate_key(&rec.id, "tg-another-secret-1", "alice").await,
            Err(ApiKeyError::Inactive { .. })
        ));
    }

    #[tokio::test]
    async fn list_filters_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(dir.path()).await;
        let a = m.create_key(new_key("alice", "together", None)).await.unwrap();
        let b = m.create_key(new_key("alice", "anthropic", None)).await.unwrap();
        m.create_key(new_key("bob", "together", None)).await.unwrap();
        m.revoke_key(&b.id, "alice", None).await.unwrap();

        let alice = m
            .list_keys(&KeyFilter {
                owner: Some("alice".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);

        let active = m
            .list_keys(&KeyFilter {
                owner: Some("alice".to_string()),
                status: Some(KeyStatus::Active),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, a.id);

        assert!(m.delete_key(&a.id, "bob").await.is_err());
        m.delete_key(&a.id, "alice").await.unwrap();
        assert!(matches!(m.get_key(&a.id).await, Err(ApiKeyError::NotFound(_))));
        assert!(matches!(m.get_key("../../etc").await, Err(ApiKeyError::NotFound(_))));
    }
}
