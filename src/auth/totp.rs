//! TOTP verification and one-time backup codes.
//!
//! Code comparison is deliberately constant-time: candidate codes for each
//! accepted time step are generated server-side and compared with `subtle`
//! rather than string equality.

use anyhow::{Context, Result};
use rand::Rng;
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};

use crate::config::TwoFactorConfig;

/// TOTP time step in seconds (RFC 6238 default).
const TIME_STEP: u64 = 30;

/// Backup code length in characters.
const BACKUP_CODE_LENGTH: usize = 8;

/// Alphabet for backup codes. Skips 0/O/1/I to keep codes transcribable.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Constant-time string equality. Length is checked first; lengths are not
/// secret here (codes have a fixed public format).
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// TOTP engine bound to the configured issuer/digits/skew.
#[derive(Debug, Clone)]
pub struct TotpEngine {
    issuer: String,
    digits: usize,
    skew: u8,
}

impl TotpEngine {
    pub fn new(config: &TwoFactorConfig) -> Self {
        Self {
            issuer: config.issuer.clone(),
            digits: config.digits,
            skew: config.skew,
        }
    }

    /// Generate a fresh base32-encoded TOTP secret.
    pub fn generate_secret() -> String {
        Secret::generate_secret().to_encoded().to_string()
    }

    fn totp(&self, secret_b32: &str, account: &str) -> Result<TOTP> {
        let secret = Secret::Encoded(secret_b32.to_string())
            .to_bytes()
            .map_err(|e| anyhow::anyhow!("Invalid TOTP secret: {:?}", e))?;
        // Skew is handled in `check` so each candidate can be compared in
        // constant time.
        TOTP::new(
            Algorithm::SHA1,
            self.digits,
            0,
            TIME_STEP,
            secret,
            Some(self.issuer.clone()),
            account.to_string(),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build TOTP: {}", e))
    }

    /// The otpauth:// enrollment URL encoded into the setup QR code.
    pub fn otpauth_url(&self, secret_b32: &str, account: &str) -> Result<String> {
        Ok(self.totp(secret_b32, account)?.get_url())
    }

    /// Verify a 6-digit code against the secret, accepting `skew` time steps
    /// of clock drift in either direction.
    pub fn check(&self, secret_b32: &str, code: &str) -> Result<bool> {
        let totp = self.totp(secret_b32, "account")?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock before epoch")?
            .as_secs();

        let mut matched = false;
        for offset in 0..=self.skew as u64 {
            let ahead = now + offset * TIME_STEP;
            matched |= constant_time_eq(&totp.generate(ahead), code);
            if offset > 0 {
                let behind = now.saturating_sub(offset * TIME_STEP);
                matched |= constant_time_eq(&totp.generate(behind), code);
            }
        }
        Ok(matched)
    }

    /// Generate the currently valid code. Used by tests and enrollment checks.
    pub fn current_code(&self, secret_b32: &str) -> Result<String> {
        let totp = self.totp(secret_b32, "account")?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("System clock before epoch")?
            .as_secs();
        Ok(totp.generate(now))
    }
}

/// Generate `count` single-use backup codes.
pub fn generate_backup_codes(count: usize) -> Vec<String> {
    let mut rng = rand::rng();
    (0..count)
        .map(|_| {
            (0..BACKUP_CODE_LENGTH)
                .map(|_| {
                    let idx = rng.random_range(0..BACKUP_CODE_ALPHABET.len());
                    BACKUP_CODE_ALPHABET[idx] as char
                })
                .collect()
        })
        .collect()
}

/// Case-normalize a submitted backup code.
pub fn normalize_backup_code(code: &str) -> String {
    code.trim().replace('-', "").to_ascii_uppercase()
}

/// Hash a backup code for storage.
pub fn hash_backup_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_backup_code(code).as_bytes());
    hex::encode(hasher.finalize())
}

/// Match a submitted code against the unconsumed hash set.
///
/// Returns the set with the matched hash removed, or None if nothing matched.
/// Every stored hash is compared so the work done does not depend on where
/// (or whether) the match sits.
pub fn consume_backup_code(hashes: &[String], submitted: &str) -> Option<Vec<String>> {
    let submitted_hash = hash_backup_code(submitted);
    let mut matched_index: Option<usize> = None;
    for (i, hash) in hashes.iter().enumerate() {
        if constant_time_eq(hash, &submitted_hash) && matched_index.is_none() {
            matched_index = Some(i);
        }
    }
    matched_index.map(|i| {
        let mut remaining = hashes.to_vec();
        remaining.remove(i);
        remaining
    })
}
