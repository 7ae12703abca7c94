//! Read-only credential storage backed by environment variables.
//!
//! Each credential id maps to one variable, either through an explicit
//! mapping or the `<UPPERCASE_ID>_API_KEY` convention. An optional
//! `.env`-style file can supply values the process environment lacks; the
//! process environment always wins. Lookups are re-read on every call unless
//! file caching is explicitly enabled.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use super::StorageBackend;
use crate::error::{CredentialError, Result};
use crate::models::{CredentialKey, CredentialKind, CredentialObject};

/// Read-only storage mapping credential ids to environment variables.
pub struct EnvVarStorage {
    /// Explicit id -> variable name mapping.
    mapping: HashMap<String, String>,
    env_file: Option<PathBuf>,
    cache_env_file: bool,
    cached_file: Mutex<Option<HashMap<String, String>>>,
}

impl EnvVarStorage {
    pub fn new() -> Self {
        Self {
            mapping: HashMap::new(),
            env_file: None,
            cache_env_file: false,
            cached_file: Mutex::new(None),
        }
    }

    /// Create a storage with an explicit id -> variable name mapping.
    pub fn with_mapping(mapping: HashMap<String, String>) -> Self {
        Self {
            mapping,
            ..Self::new()
        }
    }

    /// Also consult a `.env`-style file for variables the process lacks.
    pub fn with_env_file(mut self, path: impl AsRef<Path>) -> Self {
        self.env_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Read the `.env` file once and reuse it for subsequent lookups.
    pub fn cache_env_file(mut self, cache: bool) -> Self {
        self.cache_env_file = cache;
        if !cache {
            *self.cached_file.lock().expect("env file cache poisoned") = None;
        }
        self
    }

    /// The environment variable consulted for `id`.
    pub fn var_name(&self, id: &str) -> String {
        match self.mapping.get(id) {
            Some(var) => var.clone(),
            None => format!("{}_API_KEY", id.to_uppercase()),
        }
    }

    fn file_vars(&self) -> HashMap<String, String> {
        let Some(path) = &self.env_file else {
            return HashMap::new();
        };

        if self.cache_env_file {
            let mut cached = self.cached_file.lock().expect("env file cache poisoned");
            if let Some(vars) = cached.as_ref() {
                return vars.clone();
            }
            let vars = parse_env_file(path);
            *cached = Some(vars.clone());
            return vars;
        }

        parse_env_file(path)
    }

    /// Resolve a variable: process environment first, then the file.
    fn lookup(&self, var: &str) -> Option<String> {
        if let Ok(value) = std::env::var(var) {
            if !value.is_empty() {
                return Some(value);
            }
        }
        self.file_vars().get(var).cloned()
    }

    fn read_only_error() -> CredentialError {
        CredentialError::validation(
            "environment-variable storage is read-only; set the variable instead",
        )
    }
}

impl Default for EnvVarStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse `KEY=value` lines, skipping comments and blanks, stripping quotes.
fn parse_env_file(path: &Path) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return vars;
    };

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let key = key.trim();
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            vars.insert(key.to_string(), value.to_string());
        }
    }

    vars
}

#[async_trait]
impl StorageBackend for EnvVarStorage {
    async fn save(&self, _credential: &CredentialObject) -> Result<()> {
        Err(Self::read_only_error())
    }

    async fn load(&self, id: &str) -> Result<Option<CredentialObject>> {
        let var = self.var_name(id);
        let Some(value) = self.lookup(&var) else {
            return Ok(None);
        };

        let credential = CredentialObject::new(id, CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", value));
        Ok(Some(credential))
    }

    async fn delete(&self, _id: &str) -> Result<bool> {
        Err(Self::read_only_error())
    }

    async fn list_ids(&self) -> Result<Vec<String>> {
        // Only explicitly mapped ids can be enumerated; convention-based
        // fallbacks are discovered on lookup.
        let mut ids: Vec<String> = self
            .mapping
            .iter()
            .filter(|(_, var)| self.lookup(var).is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.lookup(&self.var_name(id)).is_some())
    }

    fn is_writable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn loads_from_process_env_with_convention() {
        std::env::set_var("ENVSTORE_TEST_A_API_KEY", "value-a");

        let storage = EnvVarStorage::new();
        let cred = storage.load("envstore_test_a").await.unwrap().unwrap();
        assert_eq!(cred.credential_type, CredentialKind::ApiKey);
        assert_eq!(cred.key("api_key").unwrap().value.expose(), "value-a");

        std::env::remove_var("ENVSTORE_TEST_A_API_KEY");
        assert!(storage.load("envstore_test_a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn explicit_mapping_wins_over_convention() {
        std::env::set_var("ENVSTORE_CUSTOM_VAR", "mapped");

        let mut mapping = HashMap::new();
        mapping.insert("svc".to_string(), "ENVSTORE_CUSTOM_VAR".to_string());
        let storage = EnvVarStorage::with_mapping(mapping);

        let cred = storage.load("svc").await.unwrap().unwrap();
        assert_eq!(cred.key("api_key").unwrap().value.expose(), "mapped");

        std::env::remove_var("ENVSTORE_CUSTOM_VAR");
    }

    #[tokio::test]
    async fn save_and_delete_fail_read_only() {
        let storage = EnvVarStorage::new();
        assert!(!storage.is_writable());

        let cred = CredentialObject::new("svc", CredentialKind::ApiKey);
        assert!(matches!(
            storage.save(&cred).await,
            Err(CredentialError::ValidationFailure { .. })
        ));
        assert!(matches!(
            storage.delete("svc").await,
            Err(CredentialError::ValidationFailure { .. })
        ));
    }

    #[tokio::test]
    async fn env_file_fallback_and_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# comment line").unwrap();
        writeln!(file, "ENVSTORE_FILE_ONLY_API_KEY=from-file").unwrap();
        writeln!(file, "ENVSTORE_BOTH_API_KEY=\"file-loses\"").unwrap();
        file.flush().unwrap();

        std::env::set_var("ENVSTORE_BOTH_API_KEY", "env-wins");

        let storage = EnvVarStorage::new().with_env_file(file.path());

        let cred = storage.load("envstore_file_only").await.unwrap().unwrap();
        assert_eq!(cred.key("api_key").unwrap().value.expose(), "from-file");

        let cred = storage.load("envstore_both").await.unwrap().unwrap();
        assert_eq!(cred.key("api_key").unwrap().value.expose(), "env-wins");

        std::env::remove_var("ENVSTORE_BOTH_API_KEY");
    }

    #[test]
    fn env_file_parsing_strips_quotes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "PLAIN=abc").unwrap();
        writeln!(file, "DOUBLE=\"quoted\"").unwrap();
        writeln!(file, "SINGLE='single'").unwrap();
        writeln!(file, "  # indented comment").unwrap();
        writeln!(file, "not a pair").unwrap();
        file.flush().unwrap();

        let vars = parse_env_file(file.path());
        assert_eq!(vars.get("PLAIN").unwrap(), "abc");
        assert_eq!(vars.get("DOUBLE").unwrap(), "quoted");
        assert_eq!(vars.get("SINGLE").unwrap(), "single");
        assert_eq!(vars.len(), 3);
    }
}
