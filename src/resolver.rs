//! Template resolution for `{{credential.key}}` references.
//!
//! A reference is `{{<id>}}` or `{{<id>.<key>}}` where id and key are runs of
//! `[A-Za-z0-9_]`. A bare `{{id}}` resolves through the credential's default
//! key. Substitution works over a snapshot map so repeated references to one
//! credential observe a single consistent value per call.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{CredentialError, Result};
use crate::models::CredentialObject;

static REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{([A-Za-z0-9_]+)(?:\.([A-Za-z0-9_]+))?\}\}").expect("invalid regex")
});

/// A parsed credential reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateRef {
    pub credential_id: String,
    /// Absent for bare `{{id}}` references; the default key is used.
    pub key: Option<String>,
}

/// True iff the text contains at least one credential reference.
pub fn has_templates(text: &str) -> bool {
    REFERENCE_RE.is_match(text)
}

/// Extract every credential reference in order of appearance.
pub fn extract_references(text: &str) -> Vec<TemplateRef> {
    REFERENCE_RE
        .captures_iter(text)
        .map(|caps| TemplateRef {
            credential_id: caps[1].to_string(),
            key: caps.get(2).map(|m| m.as_str().to_string()),
        })
        .collect()
}

/// Reject text that opens a `{{` without forming a valid reference.
///
/// Used for static validation of usage specs; resolution itself leaves
/// non-matching text untouched.
pub fn check_syntax(text: &str) -> std::result::Result<(), String> {
    let mut remaining = text;
    while let Some(open) = remaining.find("{{") {
        let candidate = &remaining[open..];
        match REFERENCE_RE.find(candidate) {
            Some(m) if m.start() == 0 => {
                remaining = &candidate[m.end()..];
            }
            _ => {
                return Err(format!(
                    "unterminated or malformed reference at offset {}",
                    text.len() - remaining.len() + open
                ))
            }
        }
    }
    Ok(())
}

/// Substitute each reference in `template` with the matching secret value.
///
/// `snapshots` holds one consistent copy of every credential the caller could
/// load. Missing credentials follow `fail_on_missing`; a missing key within a
/// present credential always fails.
pub fn substitute(
    template: &str,
    snapshots: &HashMap<String, CredentialObject>,
    fail_on_missing: bool,
) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in REFERENCE_RE.captures_iter(template) {
        let whole = caps.get(0).expect("capture 0 always present");
        out.push_str(&template[last..whole.start()]);
        last = whole.end();

        let id = &caps[1];
        match snapshots.get(id) {
            Some(credential) => {
                let key = match caps.get(2) {
                    Some(name) => credential.key(name.as_str()).ok_or_else(|| {
                        CredentialError::key_not_found(id, name.as_str())
                    })?,
                    None => credential
                        .default_key()
                        .ok_or_else(|| CredentialError::key_not_found(id, "<default>"))?,
                };
                out.push_str(key.value.expose());
            }
            None if fail_on_missing => return Err(CredentialError::not_found(id)),
            None => out.push_str(whole.as_str()),
        }
    }

    out.push_str(&template[last..]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CredentialKey, CredentialKind};

    fn snapshots(creds: Vec<CredentialObject>) -> HashMap<String, CredentialObject> {
        creds.into_iter().map(|c| (c.id.clone(), c)).collect()
    }

    #[test]
    fn detects_templates() {
        assert!(has_templates("Bearer {{github.access_token}}"));
        assert!(has_templates("{{brave_search}}"));
        assert!(!has_templates("Bearer literal-token"));
        assert!(!has_templates("{{}}"));
        assert!(!has_templates("{{bad-chars!}}"));
    }

    #[test]
    fn extracts_references_in_order() {
        let refs = extract_references("{{a.x}} then {{b}} then {{a.y}}");
        assert_eq!(
            refs,
            vec![
                TemplateRef {
                    credential_id: "a".into(),
                    key: Some("x".into())
                },
                TemplateRef {
                    credential_id: "b".into(),
                    key: None
                },
                TemplateRef {
                    credential_id: "a".into(),
                    key: Some("y".into())
                },
            ]
        );
    }

    #[test]
    fn substitutes_explicit_key() {
        let creds = snapshots(vec![CredentialObject::new(
            "github_oauth",
            CredentialKind::OAuth2,
        )
        .with_key(CredentialKey::new("access_token", "ghp_123"))]);

        let out = substitute("Bearer {{github_oauth.access_token}}", &creds, true).unwrap();
        assert_eq!(out, "Bearer ghp_123");
    }

    #[test]
    fn substitutes_default_key() {
        let creds = snapshots(vec![CredentialObject::new("brave", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "BSA_X"))]);

        let out = substitute("token={{brave}}", &creds, true).unwrap();
        assert_eq!(out, "token=BSA_X");
    }

    #[test]
    fn missing_credential_policy() {
        let creds = HashMap::new();

        let err = substitute("{{stripe.key}}", &creds, true).unwrap_err();
        assert!(matches!(err, CredentialError::NotFound { .. }));

        let out = substitute("{{stripe.key}}", &creds, false).unwrap();
        assert_eq!(out, "{{stripe.key}}");
    }

    #[test]
    fn missing_key_always_fails() {
        let creds = snapshots(vec![CredentialObject::new("github", CredentialKind::OAuth2)
            .with_key(CredentialKey::new("access_token", "tok"))]);

        for fail_on_missing in [true, false] {
            let err = substitute("{{github.client_secret}}", &creds, fail_on_missing).unwrap_err();
            assert!(matches!(err, CredentialError::KeyNotFound { .. }));
        }
    }

    #[test]
    fn empty_credential_fails_default_key() {
        let creds = snapshots(vec![CredentialObject::new("empty", CredentialKind::Custom)]);
        let err = substitute("{{empty}}", &creds, true).unwrap_err();
        assert!(matches!(err, CredentialError::KeyNotFound { .. }));
    }

    #[test]
    fn repeated_references_see_one_snapshot() {
        let creds = snapshots(vec![CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "k1"))]);

        let out = substitute("{{svc.api_key}}:{{svc.api_key}}", &creds, true).unwrap();
        assert_eq!(out, "k1:k1");
    }

    #[test]
    fn surrounding_text_is_preserved() {
        let creds = snapshots(vec![CredentialObject::new("svc", CredentialKind::ApiKey)
            .with_key(CredentialKey::new("api_key", "SECRET"))]);

        let out = substitute("X-Subscription-Token: {{svc.api_key}} (v1)", &creds, true).unwrap();
        assert_eq!(out, "X-Subscription-Token: SECRET (v1)");
    }

    #[test]
    fn syntax_check_flags_unterminated() {
        assert!(check_syntax("Bearer {{github.access_token}}").is_ok());
        assert!(check_syntax("no templates here").is_ok());
        assert!(check_syntax("Bearer {{github.access_token").is_err());
        assert!(check_syntax("{{bad chars}}").is_err());
    }
}
