mod aden;
mod oauth2;

pub use aden::{AdenConfig, AdenSyncProvider, ValidationReport, ADEN_PROVIDER_ID};
pub use oauth2::{
    OAuth2Config, OAuth2Provider, OAuth2Session, OAuth2Token, RequestAuth, TokenPlacement,
    OAUTH2_PROVIDER_ID,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::Result;
use crate::models::{CredentialKind, CredentialObject};

/// Default duration before expiration within which a credential is due for
/// refresh (5 minutes). Prevents tokens expiring mid-flight.
pub const DEFAULT_REFRESH_BUFFER_SECS: i64 = 300;

/// Lifecycle authority for one or more credential kinds.
///
/// Providers decide when a credential needs refreshing and how to refresh it.
/// They never touch storage; the store persists whatever `refresh` returns.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable identifier credentials bind to via `provider_id`.
    fn provider_id(&self) -> &str;

    /// Credential kinds this provider can manage.
    fn supported_kinds(&self) -> &[CredentialKind];

    /// Perform whatever lifecycle action applies and return the updated
    /// credential. Implementations advance `last_refreshed` on success.
    async fn refresh(&self, credential: CredentialObject) -> Result<CredentialObject>;

    /// Side-effect-free check that the credential is still usable.
    async fn validate(&self, credential: &CredentialObject) -> Result<bool>;

    fn refresh_buffer(&self) -> Duration {
        Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS)
    }

    /// Whether the credential is due for refresh: any key expiring within the
    /// buffer of `now`.
    fn should_refresh(&self, credential: &CredentialObject, now: DateTime<Utc>) -> bool {
        credential.expires_within(now, self.refresh_buffer())
    }

    /// Revoke the credential upstream. Default is a no-op returning false.
    async fn revoke(&self, _credential: &CredentialObject) -> Result<bool> {
        Ok(false)
    }
}

/// Identifier of the built-in static provider.
pub const STATIC_PROVIDER_ID: &str = "static";

/// Provider for credentials with no lifecycle: API keys and custom bundles.
///
/// Returns credentials unchanged, never requests refresh, and validates iff
/// the credential has at least one key.
#[derive(Debug, Clone, Default)]
pub struct StaticProvider;

impl StaticProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn provider_id(&self) -> &str {
        STATIC_PROVIDER_ID
    }

    fn supported_kinds(&self) -> &[CredentialKind] {
        &[CredentialKind::ApiKey, CredentialKind::Custom]
    }

    async fn refresh(&self, credential: CredentialObject) -> Result<CredentialObject> {
        Ok(credential)
    }

    async fn validate(&self, credential: &CredentialObject) -> Result<bool> {
        Ok(!credential.is_empty())
    }

    fn should_refresh(&self, _credential: &CredentialObject, _now: DateTime<Utc>) -> bool {
        false
    }
}
