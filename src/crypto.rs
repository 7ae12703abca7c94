//! AES-256-GCM envelope for credentials at rest.
//!
//! Each record is encrypted with a fresh random nonce; the nonce is prepended
//! to the ciphertext so a stored blob is self-contained. The master key is
//! 32 bytes, base64-encoded when it travels through the environment, and
//! never written to disk.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::warn;

use crate::error::{CredentialError, Result};

/// Size of the encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM).
const NONCE_SIZE: usize = 12;

/// Environment variable the master key is read from by default.
pub const DEFAULT_KEY_ENV_VAR: &str = "HIVE_CREDENTIAL_KEY";

/// Generate a new random 256-bit master key.
pub fn generate_key() -> [u8; KEY_SIZE] {
    Aes256Gcm::generate_key(&mut OsRng).into()
}

/// Base64-encode a key for handing to an operator.
pub fn encode_key(key: &[u8]) -> String {
    BASE64.encode(key)
}

/// Decode and validate a base64-encoded master key.
pub fn decode_key(key_base64: &str) -> Result<[u8; KEY_SIZE]> {
    let bytes = BASE64.decode(key_base64.trim()).map_err(|e| {
        CredentialError::validation(format!("encryption key is not valid base64: {e}"))
    })?;
    key_from_bytes(&bytes)
}

/// Validate raw key material.
pub fn key_from_bytes(bytes: &[u8]) -> Result<[u8; KEY_SIZE]> {
    <[u8; KEY_SIZE]>::try_from(bytes).map_err(|_| {
        CredentialError::validation(format!(
            "encryption key must be {KEY_SIZE} bytes (256 bits), got {}",
            bytes.len()
        ))
    })
}

/// Resolve the master key: the named environment variable if set, otherwise a
/// freshly generated key announced with a one-time warning.
///
/// A generated key lives only in this process; ciphertexts written under it
/// become unreadable after restart unless the operator exports the variable.
pub fn key_from_env_or_generate(env_var: &str) -> Result<[u8; KEY_SIZE]> {
    match std::env::var(env_var) {
        Ok(value) if !value.is_empty() => decode_key(&value),
        _ => {
            let key = generate_key();
            warn!(
                "{env_var} is not set; generated an ephemeral encryption key. \
                 Set {env_var}={} to keep stored credentials readable across restarts.",
                encode_key(&key)
            );
            Ok(key)
        }
    }
}

/// Encrypt plaintext, returning `nonce || ciphertext+tag`.
pub fn encrypt(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CredentialError::validation(format!("failed to create cipher: {e}")))?;

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| CredentialError::validation(format!("encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a blob produced by [`encrypt`].
///
/// Any failure (truncation, wrong key, tampering) is a
/// [`CredentialError::DecryptionFailure`]; a corrupt record is never silently
/// treated as empty.
pub fn decrypt(key: &[u8; KEY_SIZE], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_SIZE {
        return Err(CredentialError::DecryptionFailure {
            reason: "ciphertext too short".to_string(),
        });
    }

    let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| CredentialError::DecryptionFailure {
        reason: format!("failed to create cipher: {e}"),
    })?;

    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CredentialError::DecryptionFailure {
            reason: "wrong key or corrupted data".to_string(),
        })
}
