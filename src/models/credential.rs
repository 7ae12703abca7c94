//! Credential records: a named bundle of secret keys for one upstream service.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::secret::SecretValue;

/// Kind of credential, determining which provider handles its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    #[serde(rename = "oauth2")]
    OAuth2,
    BasicAuth,
    BearerToken,
    Custom,
}

impl std::fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CredentialKind::ApiKey => "api_key",
            CredentialKind::OAuth2 => "oauth2",
            CredentialKind::BasicAuth => "basic_auth",
            CredentialKind::BearerToken => "bearer_token",
            CredentialKind::Custom => "custom",
        };
        f.write_str(s)
    }
}

/// A single named secret slot within a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialKey {
    pub name: String,

    pub value: SecretValue,

    /// Absolute expiration instant, if the secret expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl CredentialKey {
    pub fn new(name: impl Into<String>, value: impl Into<SecretValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            expires_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// A key is expired iff an expiration is set and `now` is at or past it.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Whether the key expires within `buffer` of `now` (or already has).
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        match self.expires_at {
            Some(at) => now + buffer >= at,
            None => false,
        }
    }
}

/// Key names tried, in order, when a template reference omits the key.
const DEFAULT_KEY_CANDIDATES: [&str; 3] = ["value", "api_key", "access_token"];

/// A named bundle of keys representing one credential.
///
/// The store owns the authoritative copy; callers receive clones whose secret
/// access is gated through [`SecretValue::expose`]. Key order is insertion
/// order, which the default-key rule depends on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialObject {
    pub id: String,

    pub credential_type: CredentialKind,

    /// Keys in insertion order. Names are unique within the bundle.
    #[serde(default)]
    keys: Vec<CredentialKey>,

    /// Provider responsible for lifecycle. Absent means the static provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_refreshed: Option<DateTime<Utc>>,

    #[serde(default = "default_true")]
    pub auto_refresh: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,

    #[serde(default)]
    pub use_count: u64,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl CredentialObject {
    pub fn new(id: impl Into<String>, credential_type: CredentialKind) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            credential_type,
            keys: Vec::new(),
            provider_id: None,
            last_refreshed: None,
            auto_refresh: true,
            last_used: None,
            use_count: 0,
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
        }
    }

    pub fn with_key(mut self, key: CredentialKey) -> Self {
        self.set_key(key);
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    /// Insert or replace a key by name. Replacement keeps the original position.
    pub fn set_key(&mut self, key: CredentialKey) {
        match self.keys.iter_mut().find(|k| k.name == key.name) {
            Some(existing) => *existing = key,
            None => self.keys.push(key),
        }
        self.bump_updated();
    }

    /// Remove a key by name, returning whether it was present.
    pub fn remove_key(&mut self, name: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k.name != name);
        let removed = self.keys.len() != before;
        if removed {
            self.bump_updated();
        }
        removed
    }

    pub fn key(&self, name: &str) -> Option<&CredentialKey> {
        self.keys.iter().find(|k| k.name == name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &CredentialKey> {
        self.keys.iter()
    }

    pub fn key_names(&self) -> Vec<&str> {
        self.keys.iter().map(|k| k.name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key a bare `{{id}}` reference resolves to: `value`, `api_key`,
    /// `access_token`, then the first-inserted key.
    pub fn default_key(&self) -> Option<&CredentialKey> {
        for candidate in DEFAULT_KEY_CANDIDATES {
            if let Some(key) = self.key(candidate) {
                return Some(key);
            }
        }
        self.keys.first()
    }

    /// True iff any contained key is expired.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.keys.iter().any(|k| k.is_expired(now))
    }

    /// Whether any key expires within `buffer` of `now`.
    pub fn expires_within(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.keys.iter().any(|k| k.expires_within(now, buffer))
    }

    /// Record a successful refresh.
    pub fn mark_refreshed(&mut self, now: DateTime<Utc>) {
        self.last_refreshed = Some(now);
        self.bump_updated();
    }

    /// Record a read of this credential.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_used = Some(now);
        self.use_count += 1;
    }

    fn bump_updated(&mut self) {
        let now = Utc::now();
        // Monotonic even if the wall clock stepped backwards.
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + Duration::nanoseconds(1)
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_expiry() {
        let now = Utc::now();
        let key = CredentialKey::new("access_token", "tok").with_expiry(now - Duration::seconds(1));
        assert!(key.is_expired(now));

        let key = CredentialKey::new("access_token", "tok").with_expiry(now + Duration::minutes(2));
        assert!(!key.is_expired(now));
        assert!(key.expires_within(now, Duration::minutes(5)));
        assert!(!key.expires_within(now, Duration::minutes(1)));

        let key = CredentialKey::new("api_key", "k");
        assert!(!key.is_expired(now));
        assert!(!key.expires_within(now, Duration::minutes(5)));
    }

    #[test]
    fn default_key_preference_order() {
        let cred = CredentialObject::new("svc", CredentialKind::Custom)
            .with_key(CredentialKey::new("token", "t"))
            .with_key(CredentialKey::new("access_token", "a"))
            .with_key(CredentialKey::new("api_key", "k"))
            .with_key(CredentialKey::new("value", "v"));
        assert_eq!(cred.default_key().unwrap().name, "value");

        let cred = CredentialObject::new("svc", CredentialKind::Custom)
            .with_key(CredentialKey::new("token", "t"))
            .with_key(CredentialKey::new("access_token", "a"))
            .with_key(CredentialKey::new("api_key", "k"));
        assert_eq!(cred.default_key().unwrap().name, "api_key");

        let cred = CredentialObject::new("svc", CredentialKind::Custom)
            .with_key(CredentialKey::new("token", "t"))
            .with_key(CredentialKey::new("access_token", "a"));
        assert_eq!(cred.default_key().unwrap().name, "access_token");

        let cred = CredentialObject::new("svc", CredentialKind::Custom)
            .with_key(CredentialKey::new("zeta", "z"))
            .with_key(CredentialKey::new("alpha", "a"));
        assert_eq!(cred.default_key().unwrap().name, "zeta");

        let cred = CredentialObject::new("svc", CredentialKind::Custom);
        assert!(cred.default_key().is_none());
    }

    #[test]
    fn set_key_replaces_in_place() {
        let mut cred = CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("first", "1"))
            .with_key(CredentialKey::new("second", "2"));

        cred.set_key(CredentialKey::new("first", "updated"));
        assert_eq!(cred.key_names(), vec!["first", "second"]);
        assert_eq!(cred.key("first").unwrap().value.expose(), "updated");
    }

    #[test]
    fn updated_at_moves_forward_on_mutation() {
        let mut cred = CredentialObject::new("svc", CredentialKind::ApiKey);
        let before = cred.updated_at;
        cred.set_key(CredentialKey::new("api_key", "k"));
        assert!(cred.updated_at > before);

        let before = cred.updated_at;
        cred.remove_key("api_key");
        assert!(cred.updated_at > before);
    }

    #[test]
    fn needs_refresh_when_any_key_expired() {
        let now = Utc::now();
        let cred = CredentialObject::new("svc", CredentialKind::OAuth2)
            .with_key(CredentialKey::new("access_token", "a").with_expiry(now - Duration::seconds(5)))
            .with_key(CredentialKey::new("refresh_token", "r"));
        assert!(cred.needs_refresh(now));

        let cred = CredentialObject::new("svc", CredentialKind::OAuth2)
            .with_key(CredentialKey::new("access_token", "a").with_expiry(now + Duration::hours(1)));
        assert!(!cred.needs_refresh(now));
    }

    #[test]
    fn serde_round_trip_preserves_key_order_and_expiry() {
        let now = Utc::now();
        let cred = CredentialObject::new("github_oauth", CredentialKind::OAuth2)
            .with_key(CredentialKey::new("access_token", "ghp_123").with_expiry(now))
            .with_key(CredentialKey::new("refresh_token", "ghr_456"))
            .with_provider("oauth2");

        let json = serde_json::to_string(&cred).unwrap();
        let back: CredentialObject = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, "github_oauth");
        assert_eq!(back.credential_type, CredentialKind::OAuth2);
        assert_eq!(back.provider_id.as_deref(), Some("oauth2"));
        assert_eq!(back.key_names(), vec!["access_token", "refresh_token"]);
        assert_eq!(back.key("access_token").unwrap().value.expose(), "ghp_123");
        assert_eq!(back.key("access_token").unwrap().expires_at, Some(now));
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&CredentialKind::OAuth2).unwrap(),
            "\"oauth2\""
        );
        assert_eq!(
            serde_json::to_string(&CredentialKind::ApiKey).unwrap(),
            "\"api_key\""
        );
    }
}
