use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, SecondsFormat, Utc};
use hive_credentials::error::CredentialError;
use hive_credentials::models::{CredentialKey, CredentialKind, CredentialObject};
use hive_credentials::providers::{AdenConfig, AdenSyncProvider, Provider};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn provider_for(server: &MockServer) -> AdenSyncProvider {
    AdenSyncProvider::new(
        AdenConfig::new(server.uri(), "agent-key-1")
            .with_retries(1, StdDuration::from_millis(10)),
    )
    .expect("valid config")
}

fn managed_credential(expires_in: Duration) -> CredentialObject {
    CredentialObject::new("hubspot", CredentialKind::OAuth2)
        .with_key(CredentialKey::new("access_token", "cached_token").with_expiry(Utc::now() + expires_in))
        .with_provider("aden")
}

#[tokio::test]
async fn refresh_pulls_new_token_from_manager() -> Result<()> {
    let server = MockServer::start().await;
    let expires = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);

    Mock::given(method("POST"))
        .and(path("/credentials/hubspot/refresh"))
        .and(header("Authorization", "Bearer agent-key-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "manager_token",
            "token_type": "Bearer",
            "expires_at": expires,
            "scopes": ["crm.objects.contacts.read"]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let refreshed = provider
        .refresh(managed_credential(Duration::minutes(-1)))
        .await?;

    let access = refreshed.key("access_token").unwrap();
    assert_eq!(access.value.expose(), "manager_token");
    assert!(access.expires_at.is_some());
    assert_eq!(
        access.metadata.get("scope").map(String::as_str),
        Some("crm.objects.contacts.read")
    );
    assert!(refreshed.last_refreshed.is_some());
    Ok(())
}

#[tokio::test]
async fn reauthorization_required_is_distinct() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/credentials/hubspot/refresh"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": "refresh_token_revoked",
            "requires_reauthorization": true,
            "authorization_url": "https://manager.example.com/authorize/hubspot"
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let err = provider
        .refresh(managed_credential(Duration::minutes(-1)))
        .await
        .unwrap_err();

    match err {
        CredentialError::ReauthorizationRequired {
            credential_id,
            auth_url,
        } => {
            assert_eq!(credential_id, "hubspot");
            assert_eq!(
                auth_url.as_deref(),
                Some("https://manager.example.com/authorize/hubspot")
            );
        }
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn rate_limit_carries_retry_after() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/credentials/hubspot/refresh"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": "rate_limited",
            "retry_after": 30
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let err = provider
        .refresh(managed_credential(Duration::minutes(-1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CredentialError::RateLimited {
            retry_after_secs: Some(30)
        }
    ));
    Ok(())
}

#[tokio::test]
async fn unreachable_manager_serves_unexpired_credential() -> Result<()> {
    let provider = AdenSyncProvider::new(
        AdenConfig::new("http://127.0.0.1:1", "agent-key-1")
            .with_timeout(StdDuration::from_millis(200))
            .with_retries(2, StdDuration::from_millis(10)),
    )?;

    // Token still valid for 2 minutes: degrade gracefully.
    let credential = managed_credential(Duration::minutes(2));
    let returned = provider.refresh(credential).await?;
    assert_eq!(
        returned.key("access_token").unwrap().value.expose(),
        "cached_token"
    );

    // Token already expired: the outage must propagate.
    let err = provider
        .refresh(managed_credential(Duration::minutes(-1)))
        .await
        .unwrap_err();
    assert!(matches!(err, CredentialError::BackendUnavailable { .. }));
    Ok(())
}

#[tokio::test]
async fn transient_failures_are_retried() -> Result<()> {
    let server = MockServer::start().await;
    let expires = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);

    Mock::given(method("POST"))
        .and(path("/credentials/hubspot/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "manager_token",
            "expires_at": expires
        })))
        .mount(&server)
        .await;

    // Retries cover transport failures only; a reachable server answers on
    // the first attempt and the call succeeds.
    let provider = AdenSyncProvider::new(
        AdenConfig::new(server.uri(), "agent-key-1")
            .with_retries(3, StdDuration::from_millis(10)),
    )?;
    let refreshed = provider
        .refresh(managed_credential(Duration::minutes(-1)))
        .await?;
    assert_eq!(
        refreshed.key("access_token").unwrap().value.expose(),
        "manager_token"
    );
    Ok(())
}

#[tokio::test]
async fn validation_report_exposes_structured_reasons() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/credentials/hubspot/validate"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "valid": false,
            "reasons": ["token_expired"],
            "details": {"status_code": 401}
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);
    let report = provider.validation_report("hubspot").await?;
    assert!(!report.valid);
    assert_eq!(report.reasons, vec!["token_expired".to_string()]);
    assert_eq!(report.details.get("status_code").unwrap(), &json!(401));

    assert!(!provider.validate(&managed_credential(Duration::minutes(2))).await?);
    Ok(())
}

#[tokio::test]
async fn fetch_and_list_round_trip() -> Result<()> {
    let server = MockServer::start().await;
    let expires = (Utc::now() + Duration::hours(1)).to_rfc3339_opts(SecondsFormat::Secs, true);

    Mock::given(method("GET"))
        .and(path("/credentials/hubspot"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "manager_token",
            "expires_at": expires,
            "scopes": []
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/credentials/ghost"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/credentials"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "credentials": ["hubspot", "slack"]
        })))
        .mount(&server)
        .await;

    let provider = provider_for(&server);

    let fetched = provider.fetch("hubspot").await?.unwrap();
    assert_eq!(fetched.provider_id.as_deref(), Some("aden"));
    assert_eq!(
        fetched.key("access_token").unwrap().value.expose(),
        "manager_token"
    );

    assert!(provider.fetch("ghost").await?.is_none());
    assert_eq!(
        provider.list().await?,
        vec!["hubspot".to_string(), "slack".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn tenant_header_is_sent_when_configured() -> Result<()> {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/credentials"))
        .and(header("X-Aden-Tenant", "tenant-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"credentials": []})))
        .expect(1)
        .mount(&server)
        .await;

    let provider = AdenSyncProvider::new(
        AdenConfig::new(server.uri(), "agent-key-1").with_tenant("tenant-42"),
    )?;
    assert!(provider.list().await?.is_empty());
    Ok(())
}
