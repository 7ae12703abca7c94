//! Error types for credential operations.
//!
//! Callers match on the variant to decide whether a failure is recoverable
//! (missing credential, missing key), needs a human (reauthorization), or
//! should be retried later (rate limit, backend outage). Error messages carry
//! credential identifiers where useful but never secret material.

use thiserror::Error;

/// Errors that can occur during credential operations.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Credential not found: {credential_id}")]
    NotFound { credential_id: String },

    #[error("Key '{key}' not found in credential '{credential_id}'")]
    KeyNotFound { credential_id: String, key: String },

    #[error("Decryption failed: {reason}")]
    DecryptionFailure { reason: String },

    #[error("Failed to refresh credential '{credential_id}': {reason}")]
    RefreshFailure {
        credential_id: String,
        reason: String,
    },

    #[error("Credential '{credential_id}' requires reauthorization")]
    ReauthorizationRequired {
        credential_id: String,
        /// URL the user must visit to re-authorize, when the upstream provides one.
        auth_url: Option<String>,
    },

    #[error("Rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    #[error("Validation failed: {reason}")]
    ValidationFailure { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CredentialError {
    pub fn not_found(credential_id: impl Into<String>) -> Self {
        Self::NotFound {
            credential_id: credential_id.into(),
        }
    }

    pub fn key_not_found(credential_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::KeyNotFound {
            credential_id: credential_id.into(),
            key: key.into(),
        }
    }

    pub fn refresh_failure(credential_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RefreshFailure {
            credential_id: credential_id.into(),
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::ValidationFailure {
            reason: reason.into(),
        }
    }

    pub fn backend_unavailable(reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }
}

/// Convenience result alias for credential operations.
pub type Result<T> = std::result::Result<T, CredentialError>;
