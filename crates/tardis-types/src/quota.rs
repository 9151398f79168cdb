//! Free-tier quota status and usage records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    pub user_id: String,
    pub resource: String,
    pub allowed: bool,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
}

/// One unit of tracked usage, buffered before it is flushed to analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: String,
    pub resource: String,
    pub amount: u64,
    pub timestamp: DateTime<Utc>,
}
