//! Local secret backend: AES-256-GCM encrypted rows in the database.
//!
//! Ciphertext format: base64(nonce || ciphertext || auth tag) with a
//! random 12-byte nonce per encryption. The master key must decode to
//! at least 32 bytes; the first 32 are the AES key. Plaintext is never
//! persisted; a SHA-256 of it is stored for drift detection.

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use chengis_core::secret::{SecretBackend, SecretScope};
use chengis_core::{Error, ResourceId, Result};
use chengis_db::SecretRepo;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

/// Stateless AES-256-GCM boxing, shared by the backend and its tests.
#[derive(Clone)]
pub struct MasterKey([u8; KEY_SIZE]);

impl MasterKey {
    /// Parse a hex-encoded master key. The decoded key must be at least
    /// 32 bytes; only the first 32 are used.
    pub fn from_hex(hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key)
            .map_err(|e| Error::InvalidInput(format!("master key is not hex: {e}")))?;
        if bytes.len() < KEY_SIZE {
            return Err(Error::InvalidInput(format!(
                "master key must be at least {KEY_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&bytes[..KEY_SIZE]);
        Ok(Self(key))
    }

    /// Random key for masterless dev setups. Secrets written under an
    /// ephemeral key are unreadable after a restart.
    pub fn ephemeral() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| Error::Internal(format!("encrypt: {e}")))?;
        let mut framed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(framed))
    }

    pub fn decrypt(&self, boxed: &str) -> Result<String> {
        let framed = BASE64
            .decode(boxed)
            .map_err(|e| Error::Internal(format!("ciphertext is not base64: {e}")))?;
        if framed.len() < NONCE_SIZE {
            return Err(Error::Internal("ciphertext too short".into()));
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_SIZE);
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| Error::Internal(e.to_string()))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| Error::Internal("decryption failed".into()))?;
        String::from_utf8(plaintext).map_err(|e| Error::Internal(e.to_string()))
    }
}

pub fn value_hash(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

/// The `local` backend: encrypted rows owned by this master.
pub struct LocalBackend {
    repo: Arc<SecretRepo>,
    key: MasterKey,
}

impl LocalBackend {
    pub fn new(repo: Arc<SecretRepo>, key: MasterKey) -> Self {
        Self { repo, key }
    }
}

#[async_trait]
impl SecretBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn get(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
    ) -> Result<Option<String>> {
        let record = self
            .repo
            .fetch(org_id, scope, name)
            .await
            .map_err(chengis_core::Error::from)?;
        match record {
            Some(record) => Ok(Some(self.key.decrypt(&record.ciphertext)?)),
            None => Ok(None),
        }
    }

    async fn list(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
    ) -> Result<Vec<(String, String)>> {
        let records = self
            .repo
            .list_scope(org_id, scope)
            .await
            .map_err(chengis_core::Error::from)?;
        records
            .into_iter()
            .map(|record| Ok((record.name.clone(), self.key.decrypt(&record.ciphertext)?)))
            .collect()
    }

    async fn put(
        &self,
        org_id: ResourceId,
        scope: &SecretScope,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let ciphertext = self.key.encrypt(value)?;
        self.repo
            .upsert(org_id, scope, name, &ciphertext, &value_hash(value))
            .await
            .map_err(chengis_core::Error::from)?;
        Ok(())
    }

    async fn delete(&self, org_id: ResourceId, scope: &SecretScope, name: &str) -> Result<()> {
        self.repo
            .delete(org_id, scope, name)
            .await
            .map_err(chengis_core::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> MasterKey {
        MasterKey::from_hex(&"ab".repeat(32)).unwrap()
    }

    #[test]
    fn round_trips_plaintext() {
        let k = key();
        let boxed = k.encrypt("hunter2").unwrap();
        assert_eq!(k.decrypt(&boxed).unwrap(), "hunter2");
    }

    #[test]
    fn fresh_nonce_per_encryption() {
        let k = key();
        assert_ne!(k.encrypt("same").unwrap(), k.encrypt("same").unwrap());
    }

    #[test]
    fn wrong_key_fails_to_decrypt() {
        let boxed = key().encrypt("payload").unwrap();
        let other = MasterKey::from_hex(&"cd".repeat(32)).unwrap();
        assert!(other.decrypt(&boxed).is_err());
    }

    #[test]
    fn short_key_rejected() {
        assert!(MasterKey::from_hex(&"ab".repeat(16)).is_err());
    }

    #[test]
    fn long_key_accepted() {
        assert!(MasterKey::from_hex(&"ab".repeat(48)).is_ok());
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let k = key();
        let boxed = k.encrypt("payload").unwrap();
        let mut bytes = BASE64.decode(&boxed).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(k.decrypt(&tampered).is_err());
    }

    #[test]
    fn value_hash_is_stable_sha256() {
        assert_eq!(value_hash("abc").len(), 64);
        assert_eq!(value_hash("abc"), value_hash("abc"));
        assert_ne!(value_hash("abc"), value_hash("abd"));
    }
}
