//! At-rest encryption for TOTP secrets.
//!
//! 2FA secrets never hit the database in plaintext. The stored format is:
//! `ENC:` + base64(nonce || ciphertext || tag), AES-256-GCM with a 12-byte
//! nonce and a key derived from the configured encryption secret via PBKDF2.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::pbkdf2;
use std::num::NonZeroU32;

/// The length of the AES-256 key in bytes
const KEY_LENGTH: usize = 32;

/// The length of the AES-GCM nonce in bytes
const NONCE_LENGTH: usize = 12;

/// Number of PBKDF2 iterations for key derivation
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Salt for PBKDF2 key derivation (fixed salt is acceptable here since we have a unique secret)
const PBKDF2_SALT: &[u8] = b"lexgate-totp-secret-encryption-v1";

/// Prefix added to encrypted values to identify them as encrypted
pub const ENCRYPTED_PREFIX: &str = "ENC:";

pub type SecretKey = [u8; KEY_LENGTH];

/// Derive a 256-bit encryption key from the configured secret string.
pub fn derive_key(secret: &str) -> SecretKey {
    let mut key = [0u8; KEY_LENGTH];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
        PBKDF2_SALT,
        secret.as_bytes(),
        &mut key,
    );
    key
}

/// Encrypt a plaintext string using AES-256-GCM.
///
/// The output format is: `ENC:` prefix + base64(nonce || ciphertext || tag)
pub fn encrypt(plaintext: &str, key: &SecretKey) -> Result<String> {
    use rand::RngCore;

    let mut nonce_bytes = [0u8; NONCE_LENGTH];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).context("Failed to create cipher")?;

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

    // nonce || ciphertext
    let mut combined = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);

    let encoded = BASE64.encode(&combined);
    Ok(format!("{}{}", ENCRYPTED_PREFIX, encoded))
}

/// Decrypt a ciphertext string produced by [`encrypt`].
pub fn decrypt(ciphertext: &str, key: &SecretKey) -> Result<String> {
    let encoded = ciphertext
        .strip_prefix(ENCRYPTED_PREFIX)
        .context("Ciphertext doesn't have expected prefix")?;

    let combined = BASE64.decode(encoded).context("Failed to decode base64")?;

    if combined.len() < NONCE_LENGTH + 1 {
        anyhow::bail!("Ciphertext too short");
    }

    let (nonce_bytes, ciphertext_bytes) = combined.split_at(NONCE_LENGTH);
    let nonce = Nonce::from_slice(nonce_bytes);

    let cipher = Aes256Gcm::new_from_slice(key).context("Failed to create cipher")?;
    let plaintext = cipher
        .decrypt(nonce, ciphertext_bytes)
        .map_err(|e| anyhow::anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_key_consistent() {
        let key1 = derive_key("my-secret-key");
        let key2 = derive_key("my-secret-key");
        assert_eq!(key1, key2, "Same secret should derive same key");
    }

    #[test]
    fn test_derive_key_different_secrets() {
        let key1 = derive_key("secret1");
        let key2 = derive_key("secret2");
        assert_ne!(key1, key2, "Different secrets should derive different keys");
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = derive_key("test-encryption-key");
        let plaintext = "JBSWY3DPEHPK3PXP";

        let encrypted = encrypt(plaintext, &key).unwrap();
        assert!(encrypted.starts_with(ENCRYPTED_PREFIX));
        assert_ne!(encrypted, plaintext);

        let decrypted = decrypt(&encrypted, &key).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_produces_different_ciphertext() {
        // Random nonce: encrypting the same plaintext twice differs
        let key = derive_key("test-key");
        let plaintext = "same-plaintext";

        let encrypted1 = encrypt(plaintext, &key).unwrap();
        let encrypted2 = encrypt(plaintext, &key).unwrap();

        assert_ne!(encrypted1, encrypted2);
        assert_eq!(decrypt(&encrypted1, &key).unwrap(), plaintext);
        assert_eq!(decrypt(&encrypted2, &key).unwrap(), plaintext);
    }

    #[test]
    fn test_decrypt_with_wrong_key_fails() {
        let key1 = derive_key("correct-key");
        let key2 = derive_key("wrong-key");

        let encrypted = encrypt("secret-value", &key1).unwrap();
        assert!(decrypt(&encrypted, &key2).is_err());
    }

    #[test]
    fn test_decrypt_garbage_fails() {
        let key = derive_key("test-key");
        assert!(decrypt("not-encrypted", &key).is_err());
        assert!(decrypt("ENC:!!!", &key).is_err());
        assert!(decrypt("ENC:AAAA", &key).is_err());
    }
}
