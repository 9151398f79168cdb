//! Environment configuration.

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LISTEN: &str = "0.0.0.0:8010";
const DEFAULT_DATA_DIR: &str = "./tardis-data";
const DEFAULT_FLUSH_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct TardisConfig {
    pub listen: String,
    pub data_dir: PathBuf,
    /// Base64-encoded 32-byte master key; a random key is used when unset.
    pub master_key: Option<String>,
    /// Model tried on the primary provider before other fallbacks.
    pub fallback_model: Option<String>,
    pub usage_flush_interval: Duration,
}

impl Default for TardisConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            master_key: None,
            fallback_model: None,
            usage_flush_interval: Duration::from_secs(DEFAULT_FLUSH_SECS),
        }
    }
}

impl TardisConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("TARDIS_LISTEN").unwrap_or_else(|_| DEFAULT_LISTEN.to_string());
        let data_dir = std::env::var("TARDIS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        let master_key = std::env::var("TARDIS_MASTER_KEY").ok().filter(|k| !k.is_empty());
        let fallback_model = std::env::var("TARDIS_FALLBACK_MODEL").ok().filter(|m| !m.is_empty());
        let flush_secs = match std::env::var("TARDIS_USAGE_FLUSH_SECS") {
            Ok(v) => v.parse().unwrap_or_else(|_| {
                tracing::warn!(value = %v, "invalid TARDIS_USAGE_FLUSH_SECS, using default");
                DEFAULT_FLUSH_SECS
            }),
            Err(_) => DEFAULT_FLUSH_SECS,
        };
        Self {
            listen,
            data_dir,
            master_key,
            fallback_model,
            usage_flush_interval: Duration::from_secs(flush_secs.max(1)),
        }
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.data_dir.join("keys")
    }

    pub fn consent_path(&self) -> PathBuf {
        self.data_dir.join("consent.json")
    }

    pub fn blobs_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }

    pub fn analytics_path(&self) -> PathBuf {
        self.data_dir.join("analytics.db")
    }
}
