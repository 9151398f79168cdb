//! Encryption wrappers and the stores that hold secrets: secure blob storage,
//! API keys and privacy consent.

mod api_keys;
pub mod backend;
mod crypto;
mod privacy;
mod secure;

pub use api_keys::ApiKeyManager;
pub use backend::{FileSystemBackend, InMemoryBackend};
pub use crypto::{checksum, open, seal, KeyRing, KEY_LEN, NONCE_LEN};
pub use privacy::PrivacyManager;
pub use secure::{RotationReport, SecureDataManager, StoreOptions};
pub use tardis_types::{BlobMetadata, EncryptionError, StorageBackend, StorageError};
