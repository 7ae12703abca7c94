//! Encrypted file-based credential storage.
//!
//! Directory structure:
//! ```text
//! base/
//!   credentials/
//!     {id}.enc        # AES-256-GCM blob of the serialized credential
//!   metadata/
//!     index.json      # advisory list of known ids
//! ```
//!
//! The per-credential file is authoritative; the index only speeds up
//! listing and survives being stale or missing. Writes go through a
//! temp-file-and-rename so a concurrent reader never sees a truncated blob.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, warn};

use super::StorageBackend;
use crate::crypto;
use crate::error::{CredentialError, Result};
use crate::models::CredentialObject;

/// Maximum allowed length for a credential id used as a file name.
const MAX_ID_LEN: usize = 128;

/// Advisory index of stored credential ids.
#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    updated_at: Option<DateTime<Utc>>,
}

/// File-backed credential storage with encryption at rest.
pub struct EncryptedFileStorage {
    base_path: PathBuf,
    key: [u8; crypto::KEY_SIZE],
}

impl EncryptedFileStorage {
    /// Open a store rooted at `base_path`, resolving the master key from
    /// `HIVE_CREDENTIAL_KEY` or generating an ephemeral one with a warning.
    pub fn new(base_path: impl AsRef<Path>) -> Result<Self> {
        Self::with_env_var(base_path, crypto::DEFAULT_KEY_ENV_VAR)
    }

    /// Open a store resolving the master key from a custom environment variable.
    pub fn with_env_var(base_path: impl AsRef<Path>, env_var: &str) -> Result<Self> {
        let key = crypto::key_from_env_or_generate(env_var)?;
        Ok(Self::with_key_material(base_path, key))
    }

    /// Open a store with explicit 32-byte key material.
    pub fn with_key(base_path: impl AsRef<Path>, key: &[u8]) -> Result<Self> {
        let key = crypto::key_from_bytes(key)?;
        Ok(Self::with_key_material(base_path, key))
    }

    fn with_key_material(base_path: impl AsRef<Path>, key: [u8; crypto::KEY_SIZE]) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            key,
        }
    }

    fn credentials_dir(&self) -> PathBuf {
        self.base_path.join("credentials")
    }

    fn metadata_dir(&self) -> PathBuf {
        self.base_path.join("metadata")
    }

    fn credential_file(&self, id: &str) -> PathBuf {
        self.credentials_dir().join(format!("{id}.enc"))
    }

    fn index_file(&self) -> PathBuf {
        self.metadata_dir().join("index.json")
    }

    async fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.credentials_dir(), self.metadata_dir()] {
            fs::create_dir_all(&dir).await?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o700);
                fs::set_permissions(&dir, perms).await?;
            }
        }
        Ok(())
    }

    /// Write `data` atomically: temp file in the same directory, then rename.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            fs::set_permissions(&tmp, perms).await?;
        }

        fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_index(&self) -> IndexFile {
        match fs::read_to_string(self.index_file()).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(index) => index,
                Err(e) => {
                    warn!("credential index is malformed, rebuilding: {e}");
                    IndexFile::default()
                }
            },
            Err(_) => IndexFile::default(),
        }
    }

    async fn update_index<F: FnOnce(&mut Vec<String>)>(&self, apply: F) -> Result<()> {
        let mut index = self.read_index().await;
        apply(&mut index.ids);
        index.ids.sort();
        index.ids.dedup();
        index.updated_at = Some(Utc::now());

        let json = serde_json::to_vec_pretty(&index)?;
        self.write_atomic(&self.index_file(), &json).await
    }
}

/// Validate that a credential id is safe to use as a file name.
///
/// Allowed: ASCII alphanumeric, underscore, hyphen. Max length 128.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CredentialError::validation(
            "credential id must not be empty",
        ));
    }
    if id.len() > MAX_ID_LEN {
        return Err(CredentialError::validation(format!(
            "credential id exceeds maximum length of {MAX_ID_LEN} characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CredentialError::validation(format!(
            "credential id contains invalid characters (allowed: alphanumeric, underscore, hyphen): {id}"
        )));
    }
    Ok(())
}

#[async_trait::async_trait]
impl StorageBackend for EncryptedFileStorage {
    async fn save(&self, credential: &CredentialObject) -> Result<()> {
        validate_id(&credential.id)?;
        self.ensure_dirs().await?;

        let plaintext = serde_json::to_vec(credential)?;
        let blob = crypto::encrypt(&self.key, &plaintext)?;

        let path = self.credential_file(&credential.id);
        debug!(id = %credential.id, path = %path.display(), "writing encrypted credential");
        self.write_atomic(&path, &blob).await?;

        let id = credential.id.clone();
        self.update_index(move |ids| {
            if !ids.contains(&id) {
                ids.push(id);
            }
        })
        .await
    }

    async fn load(&self, id: &str) -> Result<Option<CredentialObject>> {
        validate_id(id)?;

        let path = self.credential_file(id);
        let blob = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let plaintext = crypto::decrypt(&self.key, &blob)?;
        let credential: CredentialObject =
            serde_json::from_slice(&plaintext).map_err(|e| CredentialError::DecryptionFailure {
                reason: format!("decrypted record is not a valid credential: {e}"),
            })?;
        Ok(Some(credential))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        validate_id(id)?;

        let path = self.credential_file(id);
        let existed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if existed {
            let id = id.to_string();
            self.update_index(move |ids| ids.retain(|i| *i != id)).await?;
        }
        Ok(existed)
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        // The per-credential files are authoritative; the index is advisory.
        let mut ids = Vec::new();

        let mut entries = match fs::read_dir(self.credentials_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("enc") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        validate_id(id)?;
        Ok(fs::try_exists(self.credential_file(id)).await?)
    }
}
