//! Tool-side declarations of how a credential is used.
//!
//! A usage spec holds template references, never secret values. The store
//! resolves the templates on demand through its normal read path.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::credential::CredentialObject;
use crate::error::{CredentialError, Result};
use crate::resolver;

/// Declares which credential a tool uses and where its keys are placed in
/// outbound requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialUsageSpec {
    /// Identifier of the credential this spec references.
    pub credential_id: String,

    /// Key names the tool requires to be present in the credential.
    #[serde(default)]
    pub required_keys: Vec<String>,

    /// Header name to template string, e.g. `"Authorization" => "Bearer {{github.access_token}}"`.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query_params: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub body_fields: HashMap<String, String>,

    /// Whether the tool refuses to run without this credential.
    #[serde(default = "default_true")]
    pub required: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Where a human can go to obtain the credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub help_url: Option<String>,
}

fn default_true() -> bool {
    true
}

impl CredentialUsageSpec {
    pub fn new(credential_id: impl Into<String>) -> Self {
        Self {
            credential_id: credential_id.into(),
            required_keys: Vec::new(),
            headers: HashMap::new(),
            query_params: HashMap::new(),
            body_fields: HashMap::new(),
            required: true,
            description: String::new(),
            help_url: None,
        }
    }

    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.headers.insert(name.into(), template.into());
        self
    }

    pub fn with_query_param(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.query_params.insert(name.into(), template.into());
        self
    }

    pub fn with_body_field(mut self, name: impl Into<String>, template: impl Into<String>) -> Self {
        self.body_fields.insert(name.into(), template.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_help_url(mut self, url: impl Into<String>) -> Self {
        self.help_url = Some(url.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Check every template in the spec for well-formed `{{...}}` references.
    pub fn validate_syntax(&self) -> Result<()> {
        let all = self
            .headers
            .iter()
            .chain(self.query_params.iter())
            .chain(self.body_fields.iter());
        for (name, template) in all {
            if let Err(reason) = resolver::check_syntax(template) {
                return Err(CredentialError::validation(format!(
                    "invalid template for '{name}': {reason}"
                )));
            }
        }
        Ok(())
    }

    /// Required key names that are absent from `credential`.
    pub fn missing_keys(&self, credential: &CredentialObject) -> Vec<String> {
        self.required_keys
            .iter()
            .filter(|name| credential.key(name).is_none())
            .cloned()
            .collect()
    }
}
