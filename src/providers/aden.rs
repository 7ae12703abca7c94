//! Remote-sync provider delegating refresh to an external secret manager.
//!
//! The manager owns the upstream OAuth dance; this provider only speaks its
//! small HTTPS contract. When the manager is briefly unreachable and the
//! cached token has not expired, the provider degrades gracefully by
//! returning the credential unchanged.

use std::collections::HashMap;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::Provider;
use crate::error::{CredentialError, Result};
use crate::models::{CredentialKey, CredentialKind, CredentialObject, SecretValue};

/// Environment variables consulted by [`AdenConfig::from_env`].
pub const API_URL_ENV_VAR: &str = "ADEN_API_URL";
pub const API_KEY_ENV_VAR: &str = "ADEN_API_KEY";
pub const TENANT_ID_ENV_VAR: &str = "ADEN_TENANT_ID";

const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(15);
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: StdDuration = StdDuration::from_millis(250);

/// Connection settings for the external secret manager.
#[derive(Debug, Clone)]
pub struct AdenConfig {
    pub base_url: String,
    /// Agent key sent as a bearer token.
    pub api_key: SecretValue,
    /// Tenant conveyed in a namespace header, when multi-tenant.
    pub tenant_id: Option<String>,
    pub request_timeout: StdDuration,
    /// Attempts per request for transient network failures.
    pub retry_attempts: u32,
    pub retry_base_delay: StdDuration,
}

impl AdenConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<SecretValue>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            tenant_id: None,
            request_timeout: DEFAULT_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }

    /// Build a config from `ADEN_API_URL` / `ADEN_API_KEY` / `ADEN_TENANT_ID`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var(API_URL_ENV_VAR)
            .map_err(|_| CredentialError::validation(format!("{API_URL_ENV_VAR} is not set")))?;
        let api_key = std::env::var(API_KEY_ENV_VAR)
            .map_err(|_| CredentialError::validation(format!("{API_KEY_ENV_VAR} is not set")))?;

        let mut config = Self::new(base_url, api_key);
        config.tenant_id = std::env::var(TENANT_ID_ENV_VAR).ok().filter(|t| !t.is_empty());
        Ok(config)
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retries(mut self, attempts: u32, base_delay: StdDuration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }
}

/// Credential payload returned by the manager.
#[derive(Debug, Deserialize)]
struct RemoteCredential {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    scopes: Vec<String>,
    #[serde(default)]
    metadata: HashMap<String, Value>,
}

/// Error payload returned by the manager on failures.
#[derive(Debug, Default, Deserialize)]
struct RemoteError {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    requires_reauthorization: bool,
    #[serde(default)]
    authorization_url: Option<String>,
    #[serde(default)]
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    credentials: Vec<String>,
}

/// Structured validity report, mirroring the manager's health checks.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default)]
    pub reasons: Vec<String>,
    #[serde(default)]
    pub details: HashMap<String, Value>,
}

/// Identifier of the default remote-sync provider registration.
pub const ADEN_PROVIDER_ID: &str = "aden";

/// Provider that delegates credential lifecycle to an Aden secret manager.
pub struct AdenSyncProvider {
    provider_id: String,
    config: AdenConfig,
    client: reqwest::Client,
}

impl AdenSyncProvider {
    pub fn new(config: AdenConfig) -> Result<Self> {
        Self::with_provider_id(ADEN_PROVIDER_ID, config)
    }

    pub fn with_provider_id(provider_id: impl Into<String>, config: AdenConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CredentialError::validation(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            provider_id: provider_id.into(),
            config,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url.trim_end_matches('/'))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, self.url(path))
            .bearer_auth(self.config.api_key.expose())
            .header("Accept", "application/json");
        if let Some(tenant) = &self.config.tenant_id {
            req = req.header("X-Aden-Tenant", tenant);
        }
        req
    }

    /// Send with bounded exponential backoff on transport failures only;
    /// HTTP error statuses are never retried here.
    async fn send_with_retry(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let mut last_error = None;
        for attempt in 0..self.config.retry_attempts {
            if attempt > 0 {
                let delay = self.config.retry_base_delay * 2u32.pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
            match build().send().await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(attempt, "request to secret manager failed: {e}");
                    last_error = Some(e);
                }
            }
        }
        Err(CredentialError::backend_unavailable(format!(
            "secret manager unreachable: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// Map a non-success response to the error taxonomy.
    async fn response_error(
        credential_id: &str,
        response: reqwest::Response,
    ) -> CredentialError {
        let status = response.status();
        let remote: RemoteError = response.json().await.unwrap_or_default();

        if remote.requires_reauthorization {
            return CredentialError::ReauthorizationRequired {
                credential_id: credential_id.to_string(),
                auth_url: remote.authorization_url,
            };
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return CredentialError::RateLimited {
                retry_after_secs: remote.retry_after,
            };
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return CredentialError::validation(format!(
                "secret manager rejected the agent key ({status})"
            ));
        }

        CredentialError::refresh_failure(
            credential_id,
            format!(
                "secret manager returned status {status}{}",
                remote
                    .error
                    .map(|e| format!(": {e}"))
                    .unwrap_or_default()
            ),
        )
    }

    fn apply_remote(credential: &mut CredentialObject, remote: RemoteCredential) {
        let mut access = CredentialKey::new("access_token", remote.access_token);
        if let Some(expires_at) = remote.expires_at {
            access = access.with_expiry(expires_at);
        }
        if let Some(token_type) = remote.token_type {
            access = access.with_metadata("token_type", token_type);
        }
        if !remote.scopes.is_empty() {
            access = access.with_metadata("scope", remote.scopes.join(" "));
        }
        for (name, value) in remote.metadata {
            let rendered = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            access = access.with_metadata(name, rendered);
        }
        credential.set_key(access);
        credential.mark_refreshed(Utc::now());
    }

    /// Fetch the manager's current view of a credential.
    pub async fn fetch(&self, credential_id: &str) -> Result<Option<CredentialObject>> {
        let response = self
            .send_with_retry(|| self.request(reqwest::Method::GET, &format!("/credentials/{credential_id}")))
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::response_error(credential_id, response).await);
        }

        let remote: RemoteCredential = response.json().await.map_err(|e| {
            CredentialError::backend_unavailable(format!("invalid manager response: {e}"))
        })?;

        let mut credential = CredentialObject::new(credential_id, CredentialKind::OAuth2)
            .with_provider(self.provider_id.clone());
        Self::apply_remote(&mut credential, remote);
        Ok(Some(credential))
    }

    /// List credential ids the manager knows about.
    pub async fn list(&self) -> Result<Vec<String>> {
        let response = self
            .send_with_retry(|| self.request(reqwest::Method::GET, "/credentials"))
            .await?;

        if !response.status().is_success() {
            return Err(Self::response_error("<list>", response).await);
        }

        let body: ListResponse = response.json().await.map_err(|e| {
            CredentialError::backend_unavailable(format!("invalid manager response: {e}"))
        })?;
        Ok(body.credentials)
    }

    /// The manager's structured validity report for a credential.
    pub async fn validation_report(&self, credential_id: &str) -> Result<ValidationReport> {
        let response = self
            .send_with_retry(|| {
                self.request(
                    reqwest::Method::GET,
                    &format!("/credentials/{credential_id}/validate"),
                )
            })
            .await?;

        if !response.status().is_success() {
            return Err(Self::response_error(credential_id, response).await);
        }

        response.json().await.map_err(|e| {
            CredentialError::backend_unavailable(format!("invalid manager response: {e}"))
        })
    }
}

#[async_trait]
impl Provider for AdenSyncProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supported_kinds(&self) -> &[CredentialKind] {
        &[CredentialKind::OAuth2, CredentialKind::BearerToken]
    }

    async fn refresh(&self, mut credential: CredentialObject) -> Result<CredentialObject> {
        let path = format!("/credentials/{}/refresh", credential.id);
        let response = match self
            .send_with_retry(|| self.request(reqwest::Method::POST, &path))
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Degrade gracefully: a briefly unreachable manager should not
                // take down callers whose token is still good.
                if !credential.needs_refresh(Utc::now()) {
                    warn!(
                        credential_id = %credential.id,
                        "secret manager unreachable, serving unexpired credential: {e}"
                    );
                    return Ok(credential);
                }
                return Err(e);
            }
        };

        if !response.status().is_success() {
            return Err(Self::response_error(&credential.id, response).await);
        }

        let remote: RemoteCredential = response.json().await.map_err(|e| {
            CredentialError::refresh_failure(
                &credential.id,
                format!("invalid manager response: {e}"),
            )
        })?;

        Self::apply_remote(&mut credential, remote);
        Ok(credential)
    }

    async fn validate(&self, credential: &CredentialObject) -> Result<bool> {
        Ok(self.validation_report(&credential.id).await?.valid)
    }

    async fn revoke(&self, credential: &CredentialObject) -> Result<bool> {
        let path = format!("/credentials/{}", credential.id);
        let response = self
            .send_with_retry(|| self.request(reqwest::Method::DELETE, &path))
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CredentialError::validation(format!(
                "secret manager rejected the agent key ({status})"
            )));
        }
        if !status.is_success() {
            return Err(Self::response_error(&credential.id, response).await);
        }
        Ok(true)
    }
}
