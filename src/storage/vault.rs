//! Credential storage backed by a versioned key-value secret engine (KV v2).
//!
//! Secrets are flattened into the engine's data map: one entry per credential
//! key, plus reserved `_`-prefixed fields (`_type`, `_provider_id`,
//! `_expires_<key>`, usage counters) so a record survives the round trip.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::StorageBackend;
use crate::error::{CredentialError, Result};
use crate::models::{CredentialKey, CredentialKind, CredentialObject, SecretValue};

/// Environment variable consulted when no token is supplied.
pub const TOKEN_ENV_VAR: &str = "VAULT_TOKEN";

const DEFAULT_MOUNT: &str = "secret";
const DEFAULT_PATH_PREFIX: &str = "credentials";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for the secret engine.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub base_url: String,
    pub token: SecretValue,
    pub mount: String,
    pub path_prefix: String,
    pub namespace: Option<String>,
    pub request_timeout: Duration,
}

impl VaultConfig {
    pub fn new(base_url: impl Into<String>, token: impl Into<SecretValue>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
            mount: DEFAULT_MOUNT.to_string(),
            path_prefix: DEFAULT_PATH_PREFIX.to_string(),
            namespace: None,
            request_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Build a config reading the token from `VAULT_TOKEN`.
    pub fn from_env(base_url: impl Into<String>) -> Result<Self> {
        let token = std::env::var(TOKEN_ENV_VAR).map_err(|_| {
            CredentialError::validation(format!("{TOKEN_ENV_VAR} is not set and no token supplied"))
        })?;
        Ok(Self::new(base_url, token))
    }

    pub fn with_mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

/// KV v2 read response envelope.
#[derive(Debug, Deserialize)]
struct ReadResponse {
    data: ReadData,
}

#[derive(Debug, Deserialize)]
struct ReadData {
    data: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: ListData,
}

#[derive(Debug, Deserialize)]
struct ListData {
    keys: Vec<String>,
}

/// Credential storage over a remote KV v2 secret engine.
pub struct VaultStorage {
    config: VaultConfig,
    client: reqwest::Client,
}

impl VaultStorage {
    pub fn new(config: VaultConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CredentialError::validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn data_url(&self, id: &str) -> String {
        format!(
            "{}/v1/{}/data/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.mount,
            self.config.path_prefix,
            id
        )
    }

    fn metadata_url(&self, id: &str) -> String {
        format!(
            "{}/v1/{}/metadata/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.mount,
            self.config.path_prefix,
            id
        )
    }

    fn list_url(&self) -> String {
        format!(
            "{}/v1/{}/metadata/{}?list=true",
            self.config.base_url.trim_end_matches('/'),
            self.config.mount,
            self.config.path_prefix
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, url)
            .header("X-Vault-Token", self.config.token.expose());
        if let Some(namespace) = &self.config.namespace {
            req = req.header("X-Vault-Namespace", namespace);
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        req.send()
            .await
            .map_err(|e| CredentialError::backend_unavailable(format!("vault request failed: {e}")))
    }

    /// Map a non-success status to the error taxonomy.
    fn status_error(status: reqwest::StatusCode) -> CredentialError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            CredentialError::validation(format!("vault rejected the token ({status})"))
        } else {
            CredentialError::backend_unavailable(format!("vault returned status {status}"))
        }
    }

    fn flatten(credential: &CredentialObject) -> HashMap<String, Value> {
        let mut data = HashMap::new();
        data.insert("_type".to_string(), json!(credential.credential_type));
        if let Some(provider_id) = &credential.provider_id {
            data.insert("_provider_id".to_string(), json!(provider_id));
        }
        if let Some(last_refreshed) = credential.last_refreshed {
            data.insert("_last_refreshed".to_string(), json!(last_refreshed));
        }
        if let Some(last_used) = credential.last_used {
            data.insert("_last_used".to_string(), json!(last_used));
        }
        data.insert("_use_count".to_string(), json!(credential.use_count));

        for key in credential.keys() {
            data.insert(key.name.clone(), json!(key.value.expose()));
            if let Some(expires_at) = key.expires_at {
                data.insert(format!("_expires_{}", key.name), json!(expires_at));
            }
        }
        data
    }

    fn unflatten(id: &str, data: HashMap<String, Value>) -> Result<CredentialObject> {
        let kind = data
            .get("_type")
            .cloned()
            .map(serde_json::from_value::<CredentialKind>)
            .transpose()?
            .unwrap_or(CredentialKind::Custom);

        let mut credential = CredentialObject::new(id, kind);
        credential.provider_id = data
            .get("_provider_id")
            .and_then(|v| v.as_str())
            .map(String::from);
        credential.last_refreshed = parse_instant(data.get("_last_refreshed"));
        credential.last_used = parse_instant(data.get("_last_used"));
        credential.use_count = data
            .get("_use_count")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        // Flattening loses insertion order; reconstruct keys sorted by name
        // so repeated loads are deterministic.
        let mut names: Vec<String> = data
            .keys()
            .filter(|name| !name.starts_with('_'))
            .cloned()
            .collect();
        names.sort();

        for name in &names {
            let Some(value) = data.get(name).and_then(|v| v.as_str()) else {
                continue;
            };
            let mut key = CredentialKey::new(name.clone(), value);
            if let Some(expires_at) = parse_instant(data.get(&format!("_expires_{name}"))) {
                key = key.with_expiry(expires_at);
            }
            credential.set_key(key);
        }

        Ok(credential)
    }
}

fn parse_instant(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl StorageBackend for VaultStorage {
    async fn save(&self, credential: &CredentialObject) -> Result<()> {
        let body = json!({ "data": Self::flatten(credential) });
        let url = self.data_url(&credential.id);
        debug!(id = %credential.id, "writing credential to vault");

        let response = self
            .send(self.request(reqwest::Method::POST, &url).json(&body))
            .await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response.status()));
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<CredentialObject>> {
        let url = self.data_url(id);
        let response = self.send(self.request(reqwest::Method::GET, &url)).await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::status_error(status));
        }

        let body: ReadResponse = response.json().await.map_err(|e| {
            CredentialError::backend_unavailable(format!("invalid vault response: {e}"))
        })?;
        Ok(Some(Self::unflatten(id, body.data.data)?))
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let url = self.metadata_url(id);
        let response = self
            .send(self.request(reqwest::Method::DELETE, &url))
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::status_error(status));
        }
        Ok(true)
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        let url = self.list_url();
        let response = self.send(self.request(reqwest::Method::GET, &url)).await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(Self::status_error(status));
        }

        let body: ListResponse = response.json().await.map_err(|e| {
            CredentialError::backend_unavailable(format!("invalid vault response: {e}"))
        })?;
        let mut ids = body.data.keys;
        ids.sort();
        Ok(ids)
    }
}
