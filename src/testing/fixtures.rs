//! Pre-built settings, providers and claims
//!
//! Two providers are configured: `test`, a generic OIDC provider at
//! `https://idp.test` with PKCE, and `github` with the adapter's stock endpoints.

use crate::registry::{ProviderConfig, ProviderRegistry};
use crate::settings::{BrokerSettings, ProviderSettings};
use chrono::Utc;
use serde_json::{json, Value};

pub const TEST_PROVIDER_ID: &str = "test";
pub const TEST_ISSUER: &str = "https://idp.test";
pub const TEST_AUTH_ENDPOINT: &str = "https://idp.test/authorize";
pub const TEST_TOKEN_ENDPOINT: &str = "https://idp.test/token";
pub const TEST_JWKS_URI: &str = "https://idp.test/jwks";
pub const TEST_CLIENT_ID: &str = "broker-client";
pub const TEST_CLIENT_SECRET: &str = "broker-client-secret";

pub const GITHUB_TOKEN_ENDPOINT: &str = "https://github.com/login/oauth/access_token";
pub const GITHUB_USER_ENDPOINT: &str = "https://api.github.com/user";
pub const GITHUB_EMAILS_ENDPOINT: &str = "https://api.github.com/user/emails";

pub const TEST_SESSION_SECRET: &str = "test_session_secret_32_bytes_long!!";
pub const TEST_SUBJECT: &str = "248289761001";
pub const TEST_EMAIL: &str = "ada@example.com";
pub const TEST_NAME: &str = "Ada Lovelace";

/// Settings with the `test` and `github` providers and fast retries
#[must_use]
pub fn test_settings() -> BrokerSettings {
    let mut settings = BrokerSettings::default();
    settings.application.allow_inline_secrets = true;
    settings.session.secret = TEST_SESSION_SECRET.to_string();
    settings.cookies.secure = false;
    settings.http.retry_backoff_ms = 1;

    settings.providers = vec![
        ProviderSettings {
            id: TEST_PROVIDER_ID.to_string(),
            display_name: Some("Test IdP".to_string()),
            adapter: Some("oidc".to_string()),
            authorization_endpoint: Some(TEST_AUTH_ENDPOINT.to_string()),
            token_endpoint: Some(TEST_TOKEN_ENDPOINT.to_string()),
            jwks_uri: Some(TEST_JWKS_URI.to_string()),
            issuer: Some(TEST_ISSUER.to_string()),
            client_id: Some(TEST_CLIENT_ID.to_string()),
            client_secret: Some(TEST_CLIENT_SECRET.to_string()),
            use_pkce: Some(true),
            ..ProviderSettings::default()
        },
        ProviderSettings {
            id: "github".to_string(),
            client_id: Some("github-client".to_string()),
            client_secret: Some("github-secret".to_string()),
            ..ProviderSettings::default()
        },
    ];
    settings
}

/// Registry built from `settings` without discovery
///
/// # Panics
///
/// Panics if a configured provider is invalid
#[must_use]
pub fn test_registry(settings: &BrokerSettings) -> ProviderRegistry {
    let mut builder = ProviderRegistry::builder();
    for provider in settings.get_enabled_providers() {
        let config = ProviderConfig::from_settings(provider, &settings.application, None)
            .expect("valid test provider");
        builder.register(config).expect("unique test provider");
    }
    builder.build()
}

/// ID-token claims the `test` provider would assert for a login with `nonce`
#[must_use]
pub fn id_token_claims(nonce: &str) -> Value {
    let now = Utc::now().timestamp();
    json!({
        "iss": TEST_ISSUER,
        "aud": TEST_CLIENT_ID,
        "sub": TEST_SUBJECT,
        "email": TEST_EMAIL,
        "email_verified": true,
        "name": TEST_NAME,
        "nonce": nonce,
        "iat": now,
        "exp": now + 600,
    })
}

/// Token endpoint response body
#[must_use]
pub fn token_response(id_token: Option<&str>) -> String {
    let mut body = json!({
        "access_token": "provider-access-token",
        "token_type": "Bearer",
        "expires_in": 3600,
        "scope": "openid email profile",
    });
    if let Some(id_token) = id_token {
        body["id_token"] = Value::String(id_token.to_string());
    }
    body.to_string()
}
