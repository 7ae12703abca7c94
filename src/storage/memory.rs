//! In-memory storage implementation for testing.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::StorageBackend;
use crate::error::Result;
use crate::models::CredentialObject;

/// In-memory credential storage for testing purposes.
pub struct MemoryStorage {
    credentials: Mutex<HashMap<String, CredentialObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            credentials: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    async fn save(&self, credential: &CredentialObject) -> Result<()> {
        let mut creds = self.credentials.lock().await;
        creds.insert(credential.id.clone(), credential.clone());
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<CredentialObject>> {
        let creds = self.credentials.lock().await;
        Ok(creds.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut creds = self.credentials.lock().await;
        Ok(creds.remove(id).is_some())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let creds = self.credentials.lock().await;
        let mut ids: Vec<String> = creds.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        let creds = self.credentials.lock().await;
        Ok(creds.contains_key(id))
    }
}
