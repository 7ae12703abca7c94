mod encrypted_file;
mod env_var;
mod memory;
mod vault;

pub use encrypted_file::EncryptedFileStorage;
pub use env_var::EnvVarStorage;
pub use memory::MemoryStorage;
pub use vault::{VaultConfig, VaultStorage, TOKEN_ENV_VAR};

use async_trait::async_trait;

use crate::error::Result;
use crate::models::CredentialObject;

/// Storage trait for persisting credentials.
///
/// A backend owns its serialization format but must preserve the credential
/// identifier, kind, provider id, every key with its value and expiration,
/// and the usage counters that existed at save time.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Persist a credential, replacing any existing record with the same id.
    async fn save(&self, credential: &CredentialObject) -> Result<()>;

    /// Load a credential by id. Returns `Ok(None)` if it doesn't exist.
    async fn load(&self, id: &str) -> Result<Option<CredentialObject>>;

    /// Delete a credential by id, returning whether it existed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// List the ids of all stored credentials.
    async fn list_ids(&self) -> Result<Vec<String>>;

    /// Check whether a credential exists without decrypting it.
    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.load(id).await?.is_some())
    }

    /// Check if this backend supports writes.
    ///
    /// Read-only backends (like environment variables) fail `save` with a
    /// validation error.
    fn is_writable(&self) -> bool {
        true
    }
}
