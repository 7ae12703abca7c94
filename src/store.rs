//! The credential store: the public façade composing storage, providers,
//! the template resolver, and a TTL cache.
//!
//! Reads go cache → storage → provider refresh. Refresh for any one id is
//! serialized through a per-id lock, so concurrent readers of an expired
//! credential trigger exactly one provider call; the result is persisted
//! before the cache reflects it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{CredentialError, Result};
use crate::models::{CredentialObject, CredentialUsageSpec};
use crate::providers::{Provider, StaticProvider, STATIC_PROVIDER_ID};
use crate::resolver;
use crate::storage::{EnvVarStorage, StorageBackend};

/// Default cache TTL (5 minutes). Bounds how long a rotated secret can
/// linger in memory after storage-level rotation.
pub const DEFAULT_CACHE_TTL: StdDuration = StdDuration::from_secs(300);

struct CacheEntry {
    credential: CredentialObject,
    inserted_at: Instant,
}

#[derive(Default)]
struct StoreState {
    providers: HashMap<String, Arc<dyn Provider>>,
    usage_specs: HashMap<String, CredentialUsageSpec>,
    cache: HashMap<String, CacheEntry>,
}

/// Orchestrating façade over credential storage and lifecycle.
pub struct CredentialStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    cache_ttl: StdDuration,
    auto_refresh: bool,
    state: RwLock<StoreState>,
    refresh_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CredentialStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        let mut state = StoreState::default();
        state.providers.insert(
            STATIC_PROVIDER_ID.to_string(),
            Arc::new(StaticProvider::new()) as Arc<dyn Provider>,
        );

        Self {
            backend,
            clock: Arc::new(SystemClock),
            cache_ttl: DEFAULT_CACHE_TTL,
            auto_refresh: true,
            state: RwLock::new(state),
            refresh_locks: Mutex::new(HashMap::new()),
        }
    }

    /// A store over the read-only environment-variable backend.
    pub fn with_env_backend() -> Self {
        Self::new(Arc::new(EnvVarStorage::new()))
    }

    pub fn with_cache_ttl(mut self, ttl: StdDuration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn with_auto_refresh(mut self, auto_refresh: bool) -> Self {
        self.auto_refresh = auto_refresh;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Insert or replace a provider by its `provider_id`.
    pub async fn register_provider(&self, provider: Arc<dyn Provider>) {
        let mut state = self.state.write().await;
        state
            .providers
            .insert(provider.provider_id().to_string(), provider);
    }

    /// Record a tool's usage declaration. At most one spec per credential id;
    /// later registrations override.
    pub async fn register_usage(&self, spec: CredentialUsageSpec) -> Result<()> {
        spec.validate_syntax()?;
        let mut state = self.state.write().await;
        state.usage_specs.insert(spec.credential_id.clone(), spec);
        Ok(())
    }

    /// Fetch a credential through the cache, refreshing it when its provider
    /// reports it due and `refresh_if_needed` is set.
    pub async fn get_credential(
        &self,
        id: &str,
        refresh_if_needed: bool,
    ) -> Result<Option<CredentialObject>> {
        let now = self.clock.now();

        let credential = match self.cache_get(id).await {
            Some(cached) => cached,
            None => match self.backend.load(id).await? {
                Some(loaded) => loaded,
                None => return Ok(None),
            },
        };

        let credential = if refresh_if_needed && self.auto_refresh && credential.auto_refresh {
            let provider = self.provider_for(&credential).await;
            if provider.should_refresh(&credential, now) {
                self.refresh_serialized(credential, provider).await?
            } else {
                credential
            }
        } else {
            credential
        };

        Ok(Some(self.record_use(credential).await))
    }

    /// Convenience: the secret value of one key, or absence.
    pub async fn get_key(&self, id: &str, key_name: &str) -> Result<Option<String>> {
        Ok(self
            .get_credential(id, true)
            .await?
            .and_then(|c| c.key(key_name).map(|k| k.value.expose().to_string())))
    }

    /// Legacy convenience: the default-key value, chosen by the same rule as
    /// the template resolver.
    pub async fn get(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .get_credential(id, true)
            .await?
            .and_then(|c| c.default_key().map(|k| k.value.expose().to_string())))
    }

    /// Substitute every `{{id.key}}` reference in `template`.
    ///
    /// Each referenced credential is snapshotted once per call, so repeated
    /// references observe a consistent value even under concurrent refresh.
    pub async fn resolve(&self, template: &str, fail_on_missing: bool) -> Result<String> {
        let mut snapshots: HashMap<String, CredentialObject> = HashMap::new();

        for reference in resolver::extract_references(template) {
            if snapshots.contains_key(&reference.credential_id) {
                continue;
            }
            match self.get_credential(&reference.credential_id, true).await {
                Ok(Some(credential)) => {
                    snapshots.insert(reference.credential_id, credential);
                }
                Ok(None) | Err(CredentialError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        resolver::substitute(template, &snapshots, fail_on_missing)
    }

    /// Apply [`resolve`](Self::resolve) to every value, preserving keys.
    pub async fn resolve_headers(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>> {
        let mut resolved = HashMap::with_capacity(headers.len());
        for (name, template) in headers {
            resolved.insert(name.clone(), self.resolve(template, true).await?);
        }
        Ok(resolved)
    }

    /// Resolve the header map of the usage spec registered for `id`.
    pub async fn resolve_for_usage(&self, id: &str) -> Result<HashMap<String, String>> {
        let spec = self.usage_spec(id).await.ok_or_else(|| {
            CredentialError::validation(format!("no usage spec registered for '{id}'"))
        })?;
        self.resolve_headers(&spec.headers).await
    }

    /// Persist a credential, then populate the cache.
    pub async fn save_credential(&self, credential: &CredentialObject) -> Result<()> {
        self.backend.save(credential).await?;
        self.cache_put(credential.clone()).await;
        Ok(())
    }

    /// Remove a credential from the cache and storage, returning whether it
    /// existed.
    pub async fn delete_credential(&self, id: &str) -> Result<bool> {
        self.cache_evict(id).await;
        self.backend.delete(id).await
    }

    pub async fn list_credentials(&self) -> Result<Vec<String>> {
        self.backend.list_ids().await
    }

    /// True iff the credential can be fetched without refresh.
    pub async fn is_available(&self, id: &str) -> bool {
        match self.get_credential(id, false).await {
            Ok(present) => present.is_some(),
            Err(e) => {
                debug!(credential_id = %id, "availability check failed: {e}");
                false
            }
        }
    }

    /// The required key names missing from the credential, per its registered
    /// usage spec. Empty means the credential satisfies the spec.
    pub async fn validate_for_usage(&self, id: &str) -> Result<Vec<String>> {
        let spec = self.usage_spec(id).await.ok_or_else(|| {
            CredentialError::validation(format!("no usage spec registered for '{id}'"))
        })?;
        let credential = self
            .get_credential(id, false)
            .await?
            .ok_or_else(|| CredentialError::not_found(id))?;
        Ok(spec.missing_keys(&credential))
    }

    async fn usage_spec(&self, id: &str) -> Option<CredentialUsageSpec> {
        let state = self.state.read().await;
        state.usage_specs.get(id).cloned()
    }

    async fn provider_for(&self, credential: &CredentialObject) -> Arc<dyn Provider> {
        let state = self.state.read().await;
        let provider_id = credential
            .provider_id
            .as_deref()
            .unwrap_or(STATIC_PROVIDER_ID);

        match state.providers.get(provider_id) {
            Some(provider) => provider.clone(),
            None => {
                warn!(
                    credential_id = %credential.id,
                    provider_id,
                    "provider not registered, falling back to static"
                );
                state
                    .providers
                    .get(STATIC_PROVIDER_ID)
                    .cloned()
                    .unwrap_or_else(|| Arc::new(StaticProvider::new()))
            }
        }
    }

    /// Refresh with at-most-one concurrent refresh per credential id.
    ///
    /// Waiters re-check after acquiring the id lock and adopt the result of
    /// the refresh that already happened instead of repeating it. Commit
    /// order: refresh -> save -> cache, so the refreshed record is persisted
    /// before any cache state reflecting it is visible.
    async fn refresh_serialized(
        &self,
        credential: CredentialObject,
        provider: Arc<dyn Provider>,
    ) -> Result<CredentialObject> {
        let id = credential.id.clone();
        let lock = self.refresh_lock(&id).await;
        let _guard = lock.lock().await;

        let now = self.clock.now();
        let current = match self.cache_get(&id).await {
            Some(cached) => cached,
            None => self.backend.load(&id).await?.unwrap_or(credential),
        };
        if !provider.should_refresh(&current, now) {
            return Ok(current);
        }

        debug!(
            credential_id = %id,
            provider = provider.provider_id(),
            "refreshing credential"
        );
        self.cache_evict(&id).await;

        match provider.refresh(current.clone()).await {
            Ok(refreshed) => {
                if self.backend.is_writable() {
                    self.backend.save(&refreshed).await?;
                }
                self.cache_put(refreshed.clone()).await;
                Ok(refreshed)
            }
            Err(e) if !current.needs_refresh(now) => {
                // Within the buffer but not yet expired: absorb the failure
                // and keep serving the still-valid credential.
                warn!(credential_id = %id, "refresh failed, serving still-valid credential: {e}");
                self.cache_put(current.clone()).await;
                Ok(current)
            }
            Err(e) => Err(e),
        }
    }

    async fn refresh_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.refresh_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn cache_get(&self, id: &str) -> Option<CredentialObject> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let state = self.state.read().await;
        state
            .cache
            .get(id)
            .filter(|entry| entry.inserted_at.elapsed() < self.cache_ttl)
            .map(|entry| entry.credential.clone())
    }

    async fn cache_put(&self, credential: CredentialObject) {
        if self.cache_ttl.is_zero() {
            return;
        }
        let mut state = self.state.write().await;
        state.cache.insert(
            credential.id.clone(),
            CacheEntry {
                credential,
                inserted_at: Instant::now(),
            },
        );
    }

    async fn cache_evict(&self, id: &str) {
        let mut state = self.state.write().await;
        state.cache.remove(id);
    }

    /// Stamp usage on the returned copy and mirror it into the cache without
    /// extending the entry's TTL.
    async fn record_use(&self, mut credential: CredentialObject) -> CredentialObject {
        credential.touch(self.clock.now());

        let mut state = self.state.write().await;
        match state.cache.get_mut(&credential.id) {
            Some(entry) => entry.credential = credential.clone(),
            None => {
                if !self.cache_ttl.is_zero() {
                    state.cache.insert(
                        credential.id.clone(),
                        CacheEntry {
                            credential: credential.clone(),
                            inserted_at: Instant::now(),
                        },
                    );
                }
            }
        }
        credential
    }
}

impl Default for CredentialStore {
    fn default() -> Self {
        Self::with_env_backend()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CredentialKey, CredentialKind};
    use crate::storage::MemoryStorage;

    fn store() -> CredentialStore {
        CredentialStore::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = store();
        let cred = CredentialObject::new("github", CredentialKind::OAuth2)
            .with_key(CredentialKey::new("access_token", "tok"));

        store.save_credential(&cred).await.unwrap();

        let loaded = store.get_credential("github", true).await.unwrap().unwrap();
        assert_eq!(loaded.key("access_token").unwrap().value.expose(), "tok");
        assert!(loaded.use_count >= 1);
        assert!(loaded.last_used.is_some());
    }

    #[tokio::test]
    async fn missing_credential_is_absent() {
        let store = store();
        assert!(store.get_credential("nope", true).await.unwrap().is_none());
        assert!(store.get("nope").await.unwrap().is_none());
        assert!(!store.is_available("nope").await);
    }

    #[tokio::test]
    async fn get_key_and_default_key() {
        let store = store();
        let cred = CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "k-123"))
            .with_key(CredentialKey::new("other", "o-456"));
        store.save_credential(&cred).await.unwrap();

        assert_eq!(store.get("svc").await.unwrap().unwrap(), "k-123");
        assert_eq!(
            store.get_key("svc", "other").await.unwrap().unwrap(),
            "o-456"
        );
        assert!(store.get_key("svc", "absent").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_removes_from_cache_and_storage() {
        let store = store();
        let cred = CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "k"));
        store.save_credential(&cred).await.unwrap();

        assert!(store.delete_credential("svc").await.unwrap());
        assert!(store.get_credential("svc", false).await.unwrap().is_none());
        assert!(!store.delete_credential("svc").await.unwrap());
    }

    #[tokio::test]
    async fn unknown_provider_falls_back_to_static() {
        let store = store();
        let cred = CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "k"))
            .with_provider("never_registered");
        store.save_credential(&cred).await.unwrap();

        // Static fallback never refreshes, so the read just succeeds.
        let loaded = store.get_credential("svc", true).await.unwrap().unwrap();
        assert_eq!(loaded.key("api_key").unwrap().value.expose(), "k");
    }

    #[tokio::test]
    async fn usage_spec_validation() {
        let store = store();
        let cred = CredentialObject::new("github", CredentialKind::OAuth2)
            .with_key(CredentialKey::new("access_token", "tok"));
        store.save_credential(&cred).await.unwrap();

        store
            .register_usage(
                CredentialUsageSpec::new("github")
                    .with_required_keys(["access_token", "refresh_token"])
                    .with_header("Authorization", "Bearer {{github.access_token}}"),
            )
            .await
            .unwrap();

        let missing = store.validate_for_usage("github").await.unwrap();
        assert_eq!(missing, vec!["refresh_token".to_string()]);

        let headers = store.resolve_for_usage("github").await.unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok");
    }

    #[tokio::test]
    async fn usage_spec_required_before_resolution() {
        let store = store();
        assert!(matches!(
            store.resolve_for_usage("unregistered").await,
            Err(CredentialError::ValidationFailure { .. })
        ));
        assert!(matches!(
            store.validate_for_usage("unregistered").await,
            Err(CredentialError::ValidationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn register_usage_rejects_bad_templates() {
        let store = store();
        let spec = CredentialUsageSpec::new("svc").with_header("X-Token", "{{svc.key");
        assert!(matches!(
            store.register_usage(spec).await,
            Err(CredentialError::ValidationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let store = store().with_cache_ttl(StdDuration::ZERO);
        let cred = CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "k1"));
        store.save_credential(&cred).await.unwrap();

        // Mutate storage behind the store's back; a zero-TTL store sees it.
        let updated = CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "k2"));
        store.backend.save(&updated).await.unwrap();

        assert_eq!(store.get("svc").await.unwrap().unwrap(), "k2");
    }
}
