//! Authenticated encryption and the versioned key ring.
//!
//! - **Cipher**: ChaCha20-Poly1305, 256-bit keys
//! - **Framing**: a random 12-byte nonce is prefixed to every ciphertext
//! - **Key ring**: keys are named `k1`, `k2`, ...; the newest is current and
//!   older keys stay available for decryption until retired
//! - **Derivation**: `k1` is the master key itself; `kN` for N > 1 is
//!   `sha256("tardis-keyring" || master || N)`, so a ring can be rebuilt from
//!   the master key and the ids recorded next to the ciphertext

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::{aead::Aead, ChaCha20Poly1305, Key, KeyInit, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tardis_types::EncryptionError;
use zeroize::Zeroizing;

/// Key length in bytes (256 bits).
pub const KEY_LEN: usize = 32;

/// Nonce length for ChaCha20-Poly1305 (12 bytes).
pub const NONCE_LEN: usize = 12;

type KeyBytes = Zeroizing<[u8; KEY_LEN]>;

fn random_key() -> KeyBytes {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Encrypt `plaintext` under `key`; output is `nonce || ciphertext || tag`.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| EncryptionError::Encrypt(e.to_string()))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Inverse of [`seal`]. Fails on truncated or tampered input and on the wrong key.
pub fn open(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < NONCE_LEN {
        return Err(EncryptionError::Decrypt("ciphertext too short".to_string()));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| EncryptionError::Decrypt("authentication failed".to_string()))
}

/// sha256 hex digest.
pub fn checksum(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn derive_key(master: &KeyBytes, version: u32) -> KeyBytes {
    if version <= 1 {
        return master.clone();
    }
    let mut hasher = Sha256::new();
    hasher.update(b"tardis-keyring");
    hasher.update(&master[..]);
    hasher.update(version.to_be_bytes());
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    key.copy_from_slice(hasher.finalize().as_slice());
    key
}

/// Versioned set of data keys derived from one master key.
pub struct KeyRing {
    master: KeyBytes,
    keys: BTreeMap<u32, KeyBytes>,
    current: u32,
}

impl KeyRing {
    fn with_master(master: KeyBytes) -> Self {
        let mut keys = BTreeMap::new();
        keys.insert(1, master.clone());
        Self {
            master,
            keys,
            current: 1,
        }
    }

    /// Fresh ring under a random master key.
    pub fn generate() -> Self {
        Self::with_master(random_key())
    }

    /// Ring whose first key is the given 32 bytes.
    pub fn from_key(bytes: &[u8]) -> Result<Self, EncryptionError> {
        if bytes.len() != KEY_LEN {
            return Err(EncryptionError::InvalidKey(format!(
                "expected {} bytes, got {}",
                KEY_LEN,
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self::with_master(key))
    }

    /// Ring from a base64-encoded 32-byte master key.
    pub fn from_base64(encoded: &str) -> Result<Self, EncryptionError> {
        let bytes = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| EncryptionError::InvalidKey(e.to_string()))?,
        );
        Self::from_key(&bytes)
    }

    fn parse_id(id: &str) -> Option<u32> {
        id.strip_prefix('k').and_then(|v| v.parse().ok())
    }

    fn format_id(version: u32) -> String {
        format!("k{}", version)
    }

    pub fn current_id(&self) -> String {
        Self::format_id(self.current)
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.keys.keys().map(|v| Self::format_id(*v)).collect()
    }

    fn key(&self, id: &str) -> Result<&KeyBytes, EncryptionError> {
        Self::parse_id(id)
            .and_then(|v| self.keys.get(&v))
            .ok_or_else(|| EncryptionError::UnknownKey(id.to_string()))
    }

    /// Derive the next key version and make it current; returns its id.
    pub fn rotate(&mut self) -> String {
        let next = self.keys.keys().next_back().copied().unwrap_or(0) + 1;
        self.keys.insert(next, derive_key(&self.master, next));
        self.current = next;
        Self::format_id(next)
    }

    /// Re-derive a key seen in stored data. The newest restored version
    /// becomes current.
    pub fn restore(&mut self, id: &str) -> Result<(), EncryptionError> {
        let version = Self::parse_id(id)
            .filter(|v| *v >= 1)
            .ok_or_else(|| EncryptionError::UnknownKey(id.to_string()))?;
        self.keys
            .entry(version)
            .or_insert_with(|| derive_key(&self.master, version));
        if version > self.current {
            self.current = version;
        }
        Ok(())
    }

    /// Drop a non-current key. Returns whether it was removed.
    pub fn retire(&mut self, id: &str) -> bool {
        match Self::parse_id(id) {
            Some(v) if v != self.current => self.keys.remove(&v).is_some(),
            _ => false,
        }
    }

    /// Encrypt under the current key; returns `(key_id, sealed)`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<(String, Vec<u8>), EncryptionError> {
        let id = self.current_id();
        let sealed = seal(self.key(&id)?, plaintext)?;
        Ok((id, sealed))
    }

    pub fn decrypt(&self, key_id: &str, sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        open(self.key(key_id)?, sealed)
    }

    /// Encrypt and base64-encode (for JSON records).
    pub fn encrypt_to_string(&self, plaintext: &[u8]) -> Result<(String, String), EncryptionError> {
        let (id, sealed) = self.encrypt(plaintext)?;
        Ok((id, STANDARD.encode(sealed)))
    }

    pub fn decrypt_from_string(&self, key_id: &str, encoded: &str) -> Result<Vec<u8>, EncryptionError> {
        let sealed = STANDARD
            .decode(encoded)
            .map_err(|e| EncryptionError::Decrypt(e.to_string()))?;
        self.decrypt(key_id, &sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_and_tamper_detection() {
        let ring = KeyRing::generate();
        let (id, mut sealed) = ring.encrypt(b"patient notes").unwrap();
        assert_eq!(id, "k1");
        assert_eq!(sealed.len(), NONCE_LEN + b"patient notes".len() + 16);
        assert_eq!(ring.decrypt(&id, &sealed).unwrap(), b"patient notes");

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(ring.decrypt(&id, &sealed), Err(EncryptionError::Decrypt(_))));
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let ring = KeyRing::generate();
        let (_, a) = ring.encrypt(b"same").unwrap();
        let (_, b) = ring.encrypt(b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rotation_keeps_old_keys_until_retired() {
        let mut ring = KeyRing::generate();
        let (old_id, sealed) = ring.encrypt(b"v1").unwrap();
        let new_id = ring.rotate();
        assert_eq!(new_id, "k2");
        assert_eq!(ring.current_id(), "k2");
        assert_eq!(ring.decrypt(&old_id, &sealed).unwrap(), b"v1");

        assert!(!ring.retire(&new_id));
        assert!(ring.retire(&old_id));
        assert!(matches!(
            ring.decrypt(&old_id, &sealed),
            Err(EncryptionError::UnknownKey(_))
        ));
        assert_eq!(ring.key_ids(), vec!["k2".to_string()]);
    }

    #[test]
    fn rotated_keys_are_rebuilt_from_the_master_key() {
        let mut ring = KeyRing::from_key(&[3u8; 32]).unwrap();
        ring.rotate();
        ring.rotate();
        ring.retire("k1");
        let (id, sealed) = ring.encrypt(b"after two rotations").unwrap();
        assert_eq!(id, "k3");

        let mut fresh = KeyRing::from_key(&[3u8; 32]).unwrap();
        assert!(fresh.decrypt(&id, &sealed).is_err());
        fresh.restore(&id).unwrap();
        assert_eq!(fresh.current_id(), "k3");
        assert_eq!(fresh.decrypt(&id, &sealed).unwrap(), b"after two rotations");
        assert_eq!(fresh.rotate(), "k4");

        let mut other = KeyRing::from_key(&[4u8; 32]).unwrap();
        other.restore(&id).unwrap();
        assert!(other.decrypt(&id, &sealed).is_err());
        assert!(matches!(fresh.restore("x9"), Err(EncryptionError::UnknownKey(_))));
        assert!(fresh.restore("k0").is_err());
    }

    #[test]
    fn master_key_must_be_32_bytes() {
        assert!(KeyRing::from_base64(&STANDARD.encode([7u8; 32])).is_ok());
        assert!(matches!(
            KeyRing::from_base64(&STANDARD.encode([7u8; 16])),
            Err(EncryptionError::InvalidKey(_))
        ));
        assert!(KeyRing::from_base64("not base64!").is_err());
    }

    #[test]
    fn checksum_is_sha256_hex() {
        assert_eq!(
            checksum(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
