//! Sidecar metadata stored next to every secure blob.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub owner: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    /// Id of the key-ring entry the blob is encrypted under.
    pub key_id: String,
    /// sha256 hex of the plaintext.
    pub checksum: String,
    pub size: u64,
    #[serde(default)]
    pub allowed_users: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl BlobMetadata {
    /// Owner, system, or an explicitly allowed user may read.
    pub fn can_read(&self, requester: &str) -> bool {
        crate::can_mutate(&self.owner, requester)
            || self.allowed_users.iter().any(|u| u == requester)
    }
}
