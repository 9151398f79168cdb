//! Error enums, one per module.

use crate::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum IncidentError {
    #[error("incident not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("invalid incident: {0}")]
    Invalid(String),
    #[error("incident store error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("unknown key id: {0}")]
    UnknownKey(String),
    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("invalid storage key: {0}")]
    InvalidKey(String),
    #[error("integrity check failed for {0}")]
    Integrity(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("encryption: {0}")]
    Encryption(#[from] EncryptionError),
    #[error("storage error: {0}")]
    Other(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiKeyError {
    #[error("api key not found: {0}")]
    NotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("api key {id} is {status}")]
    Inactive { id: String, status: crate::KeyStatus },
    #[error("invalid api key: {0}")]
    Invalid(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("encryption: {0}")]
    Encryption(#[from] EncryptionError),
}

impl From<std::io::Error> for ApiKeyError {
    fn from(e: std::io::Error) -> Self {
        ApiKeyError::Io(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("no consent recorded for {user_id}/{category}")]
    NotFound { user_id: String, category: String },
    #[error("invalid consent: {0}")]
    Invalid(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConsentError {
    fn from(e: std::io::Error) -> Self {
        ConsentError::Io(e.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("analytics storage error: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("http error: {0}")]
    Http(String),
    #[error("provider {provider} returned {status}: {body}")]
    Api {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("parse error: {0}")]
    Parse(String),
    #[error("empty response")]
    EmptyResponse,
    #[error("llm error: {0}")]
    Other(String),
}

/// One attempt made by the fallback chain.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Attempt {
    pub strategy: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("all {} attempts failed", attempts.len())]
    Exhausted { attempts: Vec<Attempt> },
}

#[derive(Debug, thiserror::Error)]
pub enum QuotaError {
    #[error("quota exceeded for {resource}: used {used} of {limit}")]
    Exceeded {
        resource: String,
        used: u64,
        limit: u64,
    },
    #[error("unknown quota resource: {0}")]
    UnknownResource(String),
    #[error("usage flush failed: {0}")]
    Flush(#[from] AnalyticsError),
}

impl ErrorCode for IncidentError {
    fn code(&self) -> i32 {
        match self {
            IncidentError::NotFound(_) => 404,
            IncidentError::PermissionDenied(_) => 403,
            IncidentError::Invalid(_) => 400,
            IncidentError::Other(_) => 500,
        }
    }
}

impl ErrorCode for StorageError {
    fn code(&self) -> i32 {
        match self {
            StorageError::NotFound(_) => 404,
            StorageError::AccessDenied(_) => 403,
            StorageError::InvalidKey(_) => 400,
            _ => 500,
        }
    }
}

impl ErrorCode for ApiKeyError {
    fn code(&self) -> i32 {
        match self {
            ApiKeyError::NotFound(_) => 404,
            ApiKeyError::PermissionDenied(_) => 403,
            ApiKeyError::Inactive { .. } => 409,
            ApiKeyError::Invalid(_) => 400,
            _ => 500,
        }
    }
}

impl ErrorCode for ConsentError {
    fn code(&self) -> i32 {
        match self {
            ConsentError::NotFound { .. } => 404,
            ConsentError::Invalid(_) => 400,
            ConsentError::PermissionDenied(_) => 403,
            ConsentError::Io(_) => 500,
        }
    }
}

impl ErrorCode for AnalyticsError {
    fn code(&self) -> i32 {
        match self {
            AnalyticsError::InvalidQuery(_) => 400,
            AnalyticsError::Other(_) => 500,
        }
    }
}

impl ErrorCode for FallbackError {
    fn code(&self) -> i32 {
        502
    }
}

impl ErrorCode for QuotaError {
    fn code(&self) -> i32 {
        match self {
            QuotaError::Exceeded { .. } => 429,
            QuotaError::UnknownResource(_) => 400,
            QuotaError::Flush(_) => 500,
        }
    }
}
