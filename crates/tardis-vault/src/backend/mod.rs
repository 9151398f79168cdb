//! Blob storage backends for the secure data manager.

mod fs;
mod memory;

pub use fs::FileSystemBackend;
pub use memory::InMemoryBackend;

use tardis_types::StorageError;

/// Storage keys are restricted to `[A-Za-z0-9_-]`, 1..=128 chars, so they are
/// safe as file names.
pub(crate) fn validate_key(key: &str) -> Result<(), StorageError> {
    let ok = !key.is_empty()
        && key.len() <= 128
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::validate_key;

    #[test]
    fn rejects_path_like_keys() {
        assert!(validate_key("5f0c-aa_01").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b").is_err());
        assert!(validate_key(&"x".repeat(129)).is_err());
    }
}
