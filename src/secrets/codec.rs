use aes_gcm::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Size of the AES-GCM nonce.
const IV_SIZE: usize = 12;
/// Size of the GCM authentication tag.
const TAG_SIZE: usize = 16;

/// Authenticated encryption for secret env values.
///
/// The key is derived as SHA-256 of a process-wide master secret. Stored
/// blobs are base64 of `iv(12) || tag(16) || ciphertext`. A missing master
/// secret is tolerated until the first encrypt/decrypt call.
#[derive(Debug, Clone)]
pub struct SecretsCodec {
    key: Option<[u8; 32]>,
}

impl SecretsCodec {
    pub fn new(master_key: Option<&str>) -> Self {
        Self {
            key: master_key.map(derive_key),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.key.is_some()
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let key = self.key.ok_or_else(|| {
            Error::ConfigIncomplete("SECRETS_MASTER_KEY is not configured".into())
        })?;

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::SecretDecrypt(format!("cipher init failed: {e}")))?;

        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        // aes-gcm appends the tag to the ciphertext; re-order to iv || tag || ct.
        let sealed = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| Error::SecretDecrypt(format!("encryption failed: {e}")))?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_SIZE);

        let mut blob = Vec::with_capacity(IV_SIZE + TAG_SIZE + ciphertext.len());
        blob.extend_from_slice(&iv);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);

        Ok(BASE64.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<String> {
        let key = self
            .key
            .ok_or_else(|| Error::SecretDecrypt("SECRETS_MASTER_KEY is not configured".into()))?;

        let raw = BASE64
            .decode(blob.trim())
            .map_err(|e| Error::SecretDecrypt(format!("invalid base64: {e}")))?;
        if raw.len() < IV_SIZE + TAG_SIZE {
            return Err(Error::SecretDecrypt("blob too short".into()));
        }

        let iv = &raw[..IV_SIZE];
        let tag = &raw[IV_SIZE..IV_SIZE + TAG_SIZE];
        let ciphertext = &raw[IV_SIZE + TAG_SIZE..];

        let mut sealed = Vec::with_capacity(ciphertext.len() + TAG_SIZE);
        sealed.extend_from_slice(ciphertext);
        sealed.extend_from_slice(tag);

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| Error::SecretDecrypt(format!("cipher init failed: {e}")))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), sealed.as_slice())
            .map_err(|_| Error::SecretDecrypt("authentication tag mismatch".into()))?;

        String::from_utf8(plaintext)
            .map_err(|_| Error::SecretDecrypt("plaintext is not valid UTF-8".into()))
    }
}

fn derive_key(master: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(master.as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SecretsCodec {
        SecretsCodec::new(Some("unit-test-master-key"))
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let codec = codec();
        let blob = codec.encrypt("p@ssw0rd with spaces and ünïcode").unwrap();
        assert_eq!(codec.decrypt(&blob).unwrap(), "p@ssw0rd with spaces and ünïcode");
    }

    #[test]
    fn encrypt_is_randomized() {
        let codec = codec();
        let a = codec.encrypt("same").unwrap();
        let b = codec.encrypt("same").unwrap();
        assert_ne!(a, b);
        assert_eq!(codec.decrypt(&a).unwrap(), codec.decrypt(&b).unwrap());
    }

    #[test]
    fn tampered_blob_fails_authentication() {
        let codec = codec();
        let blob = codec.encrypt("secret").unwrap();
        let mut raw = BASE64.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);

        let err = codec.decrypt(&tampered).unwrap_err();
        assert!(matches!(err, Error::SecretDecrypt(_)));
    }

    #[test]
    fn wrong_master_key_fails() {
        let blob = codec().encrypt("secret").unwrap();
        let other = SecretsCodec::new(Some("a different master key"));
        assert!(matches!(other.decrypt(&blob), Err(Error::SecretDecrypt(_))));
    }

    #[test]
    fn missing_master_key_fails_both_directions() {
        let codec = SecretsCodec::new(None);
        assert!(!codec.is_configured());
        assert!(matches!(codec.encrypt("x"), Err(Error::ConfigIncomplete(_))));
        assert!(matches!(codec.decrypt("eHh4"), Err(Error::SecretDecrypt(_))));
    }

    #[test]
    fn blob_layout_is_iv_tag_ciphertext() {
        let codec = codec();
        let blob = codec.encrypt("abc").unwrap();
        let raw = BASE64.decode(&blob).unwrap();
        assert_eq!(raw.len(), IV_SIZE + TAG_SIZE + 3);
    }
}
