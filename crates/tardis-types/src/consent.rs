//! Privacy consent records.

use crate::{is_past, AuditEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of personal data a consent applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataCategory {
    Personal,
    Health,
    Financial,
    Location,
    Behavioral,
    Communications,
    Biometric,
}

impl DataCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DataCategory::Personal => "personal",
            DataCategory::Health => "health",
            DataCategory::Financial => "financial",
            DataCategory::Location => "location",
            DataCategory::Behavioral => "behavioral",
            DataCategory::Communications => "communications",
            DataCategory::Biometric => "biometric",
        }
    }
}

/// How much processing a user has authorized, ordered `None < Minimal < Standard < Full`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentLevel {
    #[default]
    None,
    Minimal,
    Standard,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Granted,
    Denied,
    Withdrawn,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub user_id: String,
    pub category: DataCategory,
    pub level: ConsentLevel,
    pub status: ConsentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    pub granted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub history: Vec<AuditEntry>,
}

impl ConsentRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ConsentStatus::Expired || is_past(self.expires_at, now)
    }

    /// Level actually in force at `now`.
    pub fn effective_level(&self, now: DateTime<Utc>) -> ConsentLevel {
        if self.status != ConsentStatus::Granted || self.is_expired(now) {
            ConsentLevel::None
        } else {
            self.level
        }
    }
}

/// Input for `set_consent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentGrant {
    pub user_id: String,
    pub category: DataCategory,
    pub level: ConsentLevel,
    #[serde(default)]
    pub purpose: Option<String>,
    /// Lifetime in seconds; `None` never expires.
    #[serde(default)]
    pub ttl_secs: Option<i64>,
}
