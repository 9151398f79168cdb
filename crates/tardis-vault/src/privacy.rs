//! Consent registry persisted as a single JSON document.
//!
//! Every mutation rewrites the document through a temp file and rename, so a
//! crash leaves either the old or the new state on disk.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tardis_types::{
    advance_timestamp, can_mutate, expiry_after, now, AuditEntry, ConsentError, ConsentGrant,
    ConsentLevel, ConsentRecord, ConsentStatus, DataCategory, SYSTEM_ACTOR,
};
use tokio::sync::RwLock;

type UserConsents = HashMap<DataCategory, ConsentRecord>;

pub struct PrivacyManager {
    path: PathBuf,
    consents: RwLock<HashMap<String, UserConsents>>,
}

impl PrivacyManager {
    /// Load the registry at `path`; a missing file starts empty.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ConsentError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let records: Vec<ConsentRecord> = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| ConsentError::Io(format!("corrupt consent file: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        let mut consents: HashMap<String, UserConsents> = HashMap::new();
        for record in records {
            consents
                .entry(record.user_id.clone())
                .or_default()
                .insert(record.category, record);
        }
        tracing::info!(path = %path.display(), users = consents.len(), "consent registry loaded");
        Ok(Self {
            path,
            consents: RwLock::new(consents),
        })
    }

    async fn persist(&self, consents: &HashMap<String, UserConsents>) -> Result<(), ConsentError> {
        let mut records: Vec<&ConsentRecord> =
            consents.values().flat_map(|m| m.values()).collect();
        records.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then_with(|| a.category.cmp(&b.category))
        });
        let body = serde_json::to_vec_pretty(&records).map_err(|e| ConsentError::Io(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Apply `f` to a copy of the registry and install it only once it is on disk.
    async fn commit<T, F>(&self, f: F) -> Result<T, ConsentError>
    where
        F: FnOnce(&mut HashMap<String, UserConsents>) -> Result<T, ConsentError>,
    {
        let mut consents = self.consents.write().await;
        let mut next = consents.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *consents = next;
        Ok(out)
    }

    fn ensure_actor(user_id: &str, actor: &str) -> Result<(), ConsentError> {
        if can_mutate(user_id, actor) {
            Ok(())
        } else {
            tracing::warn!(user_id = %user_id, actor = %actor, "consent change denied");
            Err(ConsentError::PermissionDenied(format!(
                "{} on consents of {}",
                actor, user_id
            )))
        }
    }

    /// Record a consent decision. `ConsentLevel::None` is stored as a denial.
    pub async fn set_consent(
        &self,
        grant: ConsentGrant,
        actor: &str,
    ) -> Result<ConsentRecord, ConsentError> {
        if grant.user_id.trim().is_empty() {
            return Err(ConsentError::Invalid("user_id must not be empty".to_string()));
        }
        Self::ensure_actor(&grant.user_id, actor)?;
        let ts = now();
        let expires_at = match grant.ttl_secs {
            Some(ttl) => Some(expiry_after(ts, ttl).ok_or_else(|| {
                ConsentError::Invalid(format!("ttl_secs out of range: {}", ttl))
            })?),
            None => None,
        };
        let status = if grant.level == ConsentLevel::None {
            ConsentStatus::Denied
        } else {
            ConsentStatus::Granted
        };
        let action = match status {
            ConsentStatus::Denied => "denied".to_string(),
            _ => format!("granted:{:?}", grant.level).to_lowercase(),
        };
        let entry = match grant.purpose.as_deref() {
            Some(purpose) => AuditEntry::new(action, actor).with_details(purpose),
            None => AuditEntry::new(action, actor),
        };

        let record = self
            .commit(|consents| {
                let user = consents.entry(grant.user_id.clone()).or_default();
                let record = match user.get_mut(&grant.category) {
                    Some(existing) => {
                        existing.level = grant.level;
                        existing.status = status;
                        existing.purpose = grant.purpose;
                        existing.granted_at = ts;
                        existing.updated_at = advance_timestamp(existing.updated_at);
                        existing.expires_at = expires_at;
                        existing.history.push(entry);
                        existing.clone()
                    }
                    None => {
                        let record = ConsentRecord {
                            user_id: grant.user_id.clone(),
                            category: grant.category,
                            level: grant.level,
                            status,
                            purpose: grant.purpose,
                            granted_at: ts,
                            updated_at: ts,
                            expires_at,
                            history: vec![entry],
                        };
                        user.insert(grant.category, record.clone());
                        record
                    }
                };
                Ok(record)
            })
            .await?;
        tracing::info!(
            user_id = %record.user_id,
            category = record.category.as_str(),
            level = ?record.level,
            "consent recorded"
        );
        Ok(record)
    }

    /// Level in force for the pair; unknown, withdrawn, denied or expired all read as `None`.
    pub async fn get_user_consent(&self, user_id: &str, category: DataCategory) -> ConsentLevel {
        self.get_user_consent_at(user_id, category, now()).await
    }

    pub async fn get_user_consent_at(
        &self,
        user_id: &str,
        category: DataCategory,
        at: DateTime<Utc>,
    ) -> ConsentLevel {
        let consents = self.consents.read().await;
        consents
            .get(user_id)
            .and_then(|m| m.get(&category))
            .map(|r| r.effective_level(at))
            .unwrap_or_default()
    }

    pub async fn get_record(
        &self,
        user_id: &str,
        category: DataCategory,
    ) -> Result<ConsentRecord, ConsentError> {
        let consents = self.consents.read().await;
        consents
            .get(user_id)
            .and_then(|m| m.get(&category))
            .cloned()
            .ok_or_else(|| ConsentError::NotFound {
                user_id: user_id.to_string(),
                category: category.as_str().to_string(),
            })
    }

    /// Whether the effective level meets `required`.
    pub async fn check_consent(
        &self,
        user_id: &str,
        category: DataCategory,
        required: ConsentLevel,
    ) -> bool {
        let level = self.get_user_consent(user_id, category).await;
        let allowed = level >= required;
        if !allowed {
            tracing::debug!(
                user_id = %user_id,
                category = category.as_str(),
                have = ?level,
                need = ?required,
                "consent check failed"
            );
        }
        allowed
    }

    pub async fn withdraw_consent(
        &self,
        user_id: &str,
        category: DataCategory,
        actor: &str,
    ) -> Result<ConsentRecord, ConsentError> {
        Self::ensure_actor(user_id, actor)?;
        let out = self
            .commit(|consents| {
                let record = consents
                    .get_mut(user_id)
                    .and_then(|m| m.get_mut(&category))
                    .ok_or_else(|| ConsentError::NotFound {
                        user_id: user_id.to_string(),
                        category: category.as_str().to_string(),
                    })?;
                record.status = ConsentStatus::Withdrawn;
                record.level = ConsentLevel::None;
                record.updated_at = advance_timestamp(record.updated_at);
                record.history.push(AuditEntry::new("withdrawn", actor));
                Ok(record.clone())
            })
            .await?;
        tracing::info!(user_id = %user_id, category = category.as_str(), "consent withdrawn");
        Ok(out)
    }

    /// All records for a user ordered by category.
    pub async fn list_user_consents(&self, user_id: &str) -> Vec<ConsentRecord> {
        let consents = self.consents.read().await;
        let mut out: Vec<ConsentRecord> = consents
            .get(user_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by_key(|r| r.category);
        out
    }

    /// Mark granted records past their expiry as `expired`; returns how many changed.
    pub async fn expire_stale(&self) -> Result<usize, ConsentError> {
        self.expire_stale_at(now()).await
    }

    pub async fn expire_stale_at(&self, at: DateTime<Utc>) -> Result<usize, ConsentError> {
        let stale = {
            let consents = self.consents.read().await;
            consents
                .values()
                .flat_map(|m| m.values())
                .any(|r| r.status == ConsentStatus::Granted && r.is_expired(at))
        };
        if !stale {
            return Ok(0);
        }
        let changed = self
            .commit(|consents| {
                let mut changed = 0;
                for record in consents.values_mut().flat_map(|m| m.values_mut()) {
                    if record.status == ConsentStatus::Granted && record.is_expired(at) {
                        record.status = ConsentStatus::Expired;
                        record.updated_at = advance_timestamp(record.updated_at);
                        record.history.push(AuditEntry::new("expired", SYSTEM_ACTOR));
                        changed += 1;
                    }
                }
                Ok(changed)
            })
            .await?;
        tracing::info!(changed, "stale consents expired");
        Ok(changed)
    }

    /// Drop every record for the user; returns how many were removed.
    pub async fn forget_user(&self, user_id: &str, actor: &str) -> Result<usize, ConsentError> {
        Self::ensure_actor(user_id, actor)?;
        if !self.consents.read().await.contains_key(user_id) {
            return Ok(0);
        }
        let removed = self
            .commit(|consents| Ok(consents.remove(user_id).map(|m| m.len()).unwrap_or(0)))
            .await?;
        tracing::info!(user_id = %user_id, actor = %actor, removed, "user consents erased");
        Ok(removed)
    }
}
