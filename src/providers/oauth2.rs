//! OAuth 2.0 provider: token-endpoint grants, refresh, and request formatting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::Provider;
use crate::error::{CredentialError, Result};
use crate::models::{CredentialKey, CredentialKind, CredentialObject, SecretValue};
use crate::store::CredentialStore;

const DEFAULT_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// Where tokens are placed in outbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenPlacement {
    /// `Authorization: <type> <token>`.
    HeaderBearer,
    /// The configured header holding the raw token.
    HeaderCustom,
    /// The `access_token` query parameter.
    QueryParam,
}

/// OAuth provider configuration.
#[derive(Debug, Clone)]
pub struct OAuth2Config {
    /// Endpoint for token-grant and refresh calls.
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretValue,
    /// Scopes sent when the caller doesn't override them.
    pub default_scopes: Vec<String>,
    pub token_placement: TokenPlacement,
    /// Required when `token_placement` is `HeaderCustom`.
    pub custom_header_name: Option<String>,
    pub request_timeout: StdDuration,
    /// Additional form fields sent with every grant and refresh.
    pub extra_token_params: HashMap<String, String>,
}

impl OAuth2Config {
    pub fn new(
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<SecretValue>,
    ) -> Self {
        Self {
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            default_scopes: Vec::new(),
            token_placement: TokenPlacement::HeaderBearer,
            custom_header_name: None,
            request_timeout: DEFAULT_TIMEOUT,
            extra_token_params: HashMap::new(),
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_placement(mut self, placement: TokenPlacement) -> Self {
        self.token_placement = placement;
        self
    }

    pub fn with_custom_header(mut self, name: impl Into<String>) -> Self {
        self.token_placement = TokenPlacement::HeaderCustom;
        self.custom_header_name = Some(name.into());
        self
    }

    pub fn with_timeout(mut self, timeout: StdDuration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_token_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_token_params.insert(name.into(), value.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.token_placement == TokenPlacement::HeaderCustom && self.custom_header_name.is_none()
        {
            return Err(CredentialError::validation(
                "custom_header_name is required for HeaderCustom token placement",
            ));
        }
        Ok(())
    }
}

/// OAuth token response (standard OAuth 2.0, RFC 6749).
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// A token obtained from the token endpoint, ready for request formatting.
#[derive(Debug, Clone)]
pub struct OAuth2Token {
    pub access_token: SecretValue,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<SecretValue>,
    pub scope: Option<String>,
    /// The raw token-endpoint response, kept as metadata.
    pub raw: Value,
}

impl OAuth2Token {
    /// Whether the token expires within `buffer` of `now` (or already has).
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(at) => now + buffer >= at,
            None => false,
        }
    }
}

/// Auth material formatted for one outbound request.
///
/// This is imperative, produced on demand for a specific request; usage-spec
/// templates are the declarative counterpart declared by tools up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestAuth {
    Headers(HashMap<String, String>),
    QueryParams(HashMap<String, String>),
}

/// Identifier of the default OAuth2 provider registration.
pub const OAUTH2_PROVIDER_ID: &str = "oauth2";

/// Provider speaking the OAuth 2.0 token-endpoint protocol.
pub struct OAuth2Provider {
    provider_id: String,
    config: OAuth2Config,
    client: reqwest::Client,
}

impl OAuth2Provider {
    pub fn new(config: OAuth2Config) -> Result<Self> {
        Self::with_provider_id(OAUTH2_PROVIDER_ID, config)
    }

    /// Create a provider registered under a custom id, so multiple OAuth
    /// services can coexist in one store.
    pub fn with_provider_id(provider_id: impl Into<String>, config: OAuth2Config) -> Result<Self> {
        config.validate()?;
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

    pub fn config(&self) -> &OAuth2Config {
        &self.config
    }

    fn scope_param(&self, scopes: Option<&[String]>) -> Option<String> {
        let scopes = match scopes {
            Some(s) => s,
            None => &self.config.default_scopes,
        };
        if scopes.is_empty() {
            None
        } else {
            Some(scopes.join(" "))
        }
    }

    async fn token_request(&self, mut form: Vec<(String, String)>) -> Result<OAuth2Token> {
        form.push(("client_id".to_string(), self.config.client_id.clone()));
        form.push((
            "client_secret".to_string(),
            self.config.client_secret.expose().to_string(),
        ));
        for (name, value) in &self.config.extra_token_params {
            form.push((name.clone(), value.clone()));
        }

        debug!(token_url = %self.config.token_url, "requesting token");

        let response = self
            .client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                CredentialError::refresh_failure(
                    &self.provider_id,
                    format!("token request failed: {e}"),
                )
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CredentialError::refresh_failure(
                &self.provider_id,
                format!("token endpoint returned status {status}: {body}"),
            ));
        }

        let raw: Value = response.json().await.map_err(|e| {
            CredentialError::refresh_failure(
                &self.provider_id,
                format!("failed to parse token response: {e}"),
            )
        })?;
        let parsed: TokenResponse = serde_json::from_value(raw.clone()).map_err(|e| {
            CredentialError::refresh_failure(
                &self.provider_id,
                format!("token response missing required fields: {e}"),
            )
        })?;

        let expires_at = parsed
            .expires_in
            .map(|seconds| Utc::now() + Duration::seconds(seconds));

        Ok(OAuth2Token {
            access_token: SecretValue::new(parsed.access_token),
            token_type: parsed.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            refresh_token: parsed.refresh_token.map(SecretValue::new),
            scope: parsed.scope,
            raw,
        })
    }

    /// Perform a `client_credentials` grant.
    pub async fn client_credentials_grant(&self, scopes: Option<&[String]>) -> Result<OAuth2Token> {
        let mut form = vec![("grant_type".to_string(), "client_credentials".to_string())];
        if let Some(scope) = self.scope_param(scopes) {
            form.push(("scope".to_string(), scope));
        }
        self.token_request(form).await
    }

    /// Perform a `refresh_token` grant.
    pub async fn refresh_token_grant(
        &self,
        refresh_token: &str,
        scopes: Option<&[String]>,
    ) -> Result<OAuth2Token> {
        let mut form = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token.to_string()),
        ];
        if let Some(scope) = self.scope_param(scopes) {
            form.push(("scope".to_string(), scope));
        }
        self.token_request(form).await
    }

    /// Write a token into a credential: the new access token with its
    /// expiration, a rotated refresh token when the endpoint returned one.
    pub fn apply_token(credential: &mut CredentialObject, token: &OAuth2Token) {
        let mut access = CredentialKey::new("access_token", token.access_token.clone())
            .with_metadata("token_type", token.token_type.clone());
        if let Some(expires_at) = token.expires_at {
            access = access.with_expiry(expires_at);
        }
        if let Some(scope) = &token.scope {
            access = access.with_metadata("scope", scope.clone());
        }
        credential.set_key(access);

        if let Some(refresh) = &token.refresh_token {
            credential.set_key(CredentialKey::new("refresh_token", refresh.clone()));
        }

        credential.mark_refreshed(Utc::now());
    }

    /// Reconstruct a token from a stored credential's keys.
    pub fn token_from_credential(credential: &CredentialObject) -> Result<OAuth2Token> {
        let access = credential
            .key("access_token")
            .ok_or_else(|| CredentialError::key_not_found(&credential.id, "access_token"))?;

        Ok(OAuth2Token {
            access_token: access.value.clone(),
            token_type: access
                .metadata
                .get("token_type")
                .cloned()
                .unwrap_or_else(|| "Bearer".to_string()),
            expires_at: access.expires_at,
            refresh_token: credential.key("refresh_token").map(|k| k.value.clone()),
            scope: access.metadata.get("scope").cloned(),
            raw: Value::Null,
        })
    }

    /// Describe how `token` is attached to an outbound request.
    pub fn format_request(&self, token: &OAuth2Token) -> Result<RequestAuth> {
        match self.config.token_placement {
            TokenPlacement::HeaderBearer => {
                let mut headers = HashMap::new();
                headers.insert(
                    "Authorization".to_string(),
                    format!("{} {}", token.token_type, token.access_token.expose()),
                );
                Ok(RequestAuth::Headers(headers))
            }
            TokenPlacement::HeaderCustom => {
                let name = self.config.custom_header_name.as_ref().ok_or_else(|| {
                    CredentialError::validation(
                        "custom_header_name is required for HeaderCustom token placement",
                    )
                })?;
                let mut headers = HashMap::new();
                headers.insert(name.clone(), token.access_token.expose().to_string());
                Ok(RequestAuth::Headers(headers))
            }
            TokenPlacement::QueryParam => {
                let mut params = HashMap::new();
                params.insert(
                    "access_token".to_string(),
                    token.access_token.expose().to_string(),
                );
                Ok(RequestAuth::QueryParams(params))
            }
        }
    }
}

#[async_trait]
impl Provider for OAuth2Provider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn supported_kinds(&self) -> &[CredentialKind] {
        &[CredentialKind::OAuth2, CredentialKind::BearerToken]
    }

    async fn refresh(&self, mut credential: CredentialObject) -> Result<CredentialObject> {
        let refresh_token = credential
            .key("refresh_token")
            .map(|k| k.value.expose().to_string())
            .ok_or_else(|| {
                CredentialError::refresh_failure(
                    &credential.id,
                    "credential has no refresh_token key",
                )
            })?;

        let token = self
            .refresh_token_grant(&refresh_token, None)
            .await
            .map_err(|e| match e {
                CredentialError::RefreshFailure { reason, .. } => {
                    CredentialError::refresh_failure(&credential.id, reason)
                }
                other => other,
            })?;

        Self::apply_token(&mut credential, &token);
        Ok(credential)
    }

    async fn validate(&self, credential: &CredentialObject) -> Result<bool> {
        let Some(access) = credential.key("access_token") else {
            return Ok(false);
        };
        Ok(!access.is_expired(Utc::now()))
    }
}

/// Thin lifecycle wrapper around one (provider, credential, store) triple.
///
/// `get_valid_token` reads through the store's refresh path, so expired
/// tokens are renewed at most once across concurrent callers.
pub struct OAuth2Session {
    provider: Arc<OAuth2Provider>,
    store: Arc<CredentialStore>,
    credential_id: String,
}

impl OAuth2Session {
    pub fn new(
        provider: Arc<OAuth2Provider>,
        store: Arc<CredentialStore>,
        credential_id: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            store,
            credential_id: credential_id.into(),
        }
    }

    /// Read the credential, refreshing it if it is within the expiry buffer,
    /// and return a usable token.
    pub async fn get_valid_token(&self) -> Result<OAuth2Token> {
        let credential = self
            .store
            .get_credential(&self.credential_id, true)
            .await?
            .ok_or_else(|| CredentialError::not_found(&self.credential_id))?;
        OAuth2Provider::token_from_credential(&credential)
    }

    /// Perform a cold `client_credentials` grant and persist the result.
    pub async fn acquire_via_client_credentials(
        &self,
        scopes: Option<&[String]>,
    ) -> Result<OAuth2Token> {
        let token = self.provider.client_credentials_grant(scopes).await?;

        let mut credential = self
            .store
            .get_credential(&self.credential_id, false)
            .await?
            .unwrap_or_else(|| {
                CredentialObject::new(&self.credential_id, CredentialKind::OAuth2)
            });
        credential.provider_id = Some(self.provider.provider_id().to_string());
        OAuth2Provider::apply_token(&mut credential, &token);

        self.store.save_credential(&credential).await?;
        Ok(token)
    }
}
