//! API key records.

use crate::{is_past, AuditEntry, Metadata};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Expired,
    Revoked,
}

impl KeyStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Expired => "expired",
            KeyStatus::Revoked => "revoked",
        }
    }
}

impl std::fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored API key. The secret itself is only ever held encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub provider: String,
    /// base64(nonce || ciphertext)
    pub encrypted_key: String,
    /// Key-ring entry `encrypted_key` is sealed under.
    #[serde(default)]
    pub key_id: String,
    pub key_prefix: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub status: KeyStatus,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rotation_history: Vec<AuditEntry>,
}

impl ApiKeyRecord {
    /// Status as seen at `now`: a past `expires_at` wins over a stored `active`.
    pub fn effective_status(&self, now: DateTime<Utc>) -> KeyStatus {
        match self.status {
            KeyStatus::Revoked => KeyStatus::Revoked,
            _ if is_past(self.expires_at, now) => KeyStatus::Expired,
            status => status,
        }
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == KeyStatus::Active
    }
}

/// Input for storing a new key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewApiKey {
    pub name: String,
    pub owner: String,
    pub provider: String,
    pub secret: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Lifetime in seconds; `None` never expires.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyFilter {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub status: Option<KeyStatus>,
    /// Without a status filter, expired keys are hidden unless this is set.
    #[serde(default)]
    pub include_expired: bool,
}

impl KeyFilter {
    pub fn matches(&self, record: &ApiKeyRecord, now: DateTime<Utc>) -> bool {
        if let Some(ref owner) = self.owner {
            if &record.owner != owner {
                return false;
            }
        }
        if let Some(ref provider) = self.provider {
            if &record.provider != provider {
                return false;
            }
        }
        let effective = record.effective_status(now);
        match self.status {
            Some(status) => effective == status,
            None => self.include_expired || effective != KeyStatus::Expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(status: KeyStatus, expires_at: Option<DateTime<Utc>>) -> ApiKeyRecord {
        let now = Utc::now();
        ApiKeyRecord {
            id: "k".to_string(),
            name: "n".to_string(),
            owner: "o".to_string(),
            provider: "together".to_string(),
            encrypted_key: String::new(),
            key_id: "k1".to_string(),
            key_prefix: String::new(),
            scopes: vec![],
            status,
            metadata: Metadata::new(),
            usage_count: 0,
            last_used_at: None,
            expires_at,
            created_at: now,
            updated_at: now,
            rotation_history: vec![],
        }
    }

    #[test]
    fn past_expiry_overrides_stored_active() {
        let now = Utc::now();
        let r = record(KeyStatus::Active, Some(now - Duration::minutes(1)));
        assert_eq!(r.effective_status(now), KeyStatus::Expired);
        assert!(!r.is_active(now));
    }

    #[test]
    fn revoked_stays_revoked_after_expiry() {
        let now = Utc::now();
        let r = record(KeyStatus::Revoked, Some(now - Duration::minutes(1)));
        assert_eq!(r.effective_status(now), KeyStatus::Revoked);
    }

    #[test]
    fn filter_hides_expired_unless_asked() {
        let now = Utc::now();
        let r = record(KeyStatus::Active, Some(now - Duration::minutes(1)));
        assert!(!KeyFilter::default().matches(&r, now));
        let all = KeyFilter {
            include_expired: true,
            ..Default::default()
        };
        assert!(all.matches(&r, now));
        let expired = KeyFilter {
            status: Some(KeyStatus::Expired),
            ..Default::default()
        };
        assert!(expired.matches(&r, now));
    }

    #[test]
    fn future_expiry_is_active() {
        let now = Utc::now();
        let r = record(KeyStatus::Active, Some(now + Duration::days(1)));
        assert!(r.is_active(now));
    }
}
