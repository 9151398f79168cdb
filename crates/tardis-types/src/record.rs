//! Shared record plumbing: ids, timestamps, audit entries and the owner check.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Free-form key/value bag carried by most records.
pub type Metadata = HashMap<String, serde_json::Value>;

/// Actor name allowed to mutate any record regardless of owner.
pub const SYSTEM_ACTOR: &str = "system";

/// Fresh record id (UUID v4, hyphenated).
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Current time in UTC.
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Next `updated_at` value: the current time, or one microsecond past `prev`
/// when the clock has not moved since the last mutation.
pub fn advance_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let current = Utc::now();
    if current > prev {
        current
    } else {
        prev + Duration::microseconds(1)
    }
}

/// True when `actor` owns the record or is the system actor.
pub fn can_mutate(owner: &str, actor: &str) -> bool {
    actor == SYSTEM_ACTOR || owner == actor
}

/// True when `expires_at` is set and not after `now`.
pub fn is_past(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    matches!(expires_at, Some(at) if at <= now)
}

/// `from + ttl_secs`, or `None` when the ttl is not positive or the result
/// falls outside the representable date range.
pub fn expiry_after(from: DateTime<Utc>, ttl_secs: i64) -> Option<DateTime<Utc>> {
    if ttl_secs <= 0 {
        return None;
    }
    Duration::try_seconds(ttl_secs).and_then(|ttl| from.checked_add_signed(ttl))
}

/// One entry of an append-only timeline / audit trail / rotation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            actor: actor.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}
