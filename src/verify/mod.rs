//! Identity verification
//!
//! OIDC providers are verified from the ID token: signature against the
//! provider's JWKS, then `iss`, `aud`, `exp`, `nbf` and `nonce`. OAuth-only
//! providers are verified by calling their userinfo endpoint with the access
//! token. Either way the result is normalized through the provider's
//! [`ClaimMapping`](crate::registry::ClaimMapping).

pub mod claims;
pub mod jwks;

use crate::error::VerificationError;
use crate::models::{AppleUserInfo, ProviderTokens, VerifiedIdentity};
use crate::oauth::transport::{ProviderClient, ProviderRequest};
use crate::registry::{ProviderAdapter, ProviderConfig};
use crate::settings::HttpSettings;
use crate::utils::crypto::{decode_jwt_segment, split_jwt};
use crate::utils::logging::LoggingHelper;
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use jwks::{verify_signature, JwksCache, SUPPORTED_ALGORITHMS};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Wait before refetching a JWKS that failed to load
const JWKS_RETRY_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct JwsHeader {
    alg: String,
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

#[derive(Clone)]
pub struct IdentityVerifier {
    jwks: JwksCache,
    client: ProviderClient,
    clock_skew: i64,
}

impl IdentityVerifier {
    #[must_use]
    pub fn new(client: ProviderClient, http: &HttpSettings) -> Self {
        Self {
            jwks: JwksCache::new(
                client.clone(),
                Duration::from_secs(http.jwks_cache_seconds),
                JWKS_RETRY_BACKOFF,
            ),
            client,
            clock_skew: i64::try_from(http.clock_skew_seconds).unwrap_or(60),
        }
    }

    /// Verify the identity behind a completed code exchange
    ///
    /// `apple_user` is the first-login `user` payload Apple posts to the callback.
    ///
    /// # Errors
    ///
    /// - `VerificationError::SignatureInvalid` for bad or unsupported ID-token signatures
    /// - `VerificationError::ClaimInvalid` for `iss`/`aud`/`exp`/`nbf`/`nonce`/`sub` problems
    /// - `VerificationError::KeyUnavailable` if the provider's keys cannot be obtained
    /// - `VerificationError::UserinfoFetch` if the userinfo call fails
    pub async fn verify(
        &self,
        provider: &ProviderConfig,
        tokens: &ProviderTokens,
        nonce: &str,
        apple_user: Option<&AppleUserInfo>,
    ) -> Result<VerifiedIdentity, VerificationError> {
        let mut identity = if provider.adapter.is_oidc() {
            let id_token = tokens
                .id_token
                .as_deref()
                .ok_or_else(|| VerificationError::claim("id_token", "missing from token response"))?;
            let claims = self.verify_id_token(provider, id_token, nonce).await?;
            claims::normalize(&provider.id, &provider.claims, claims)?
        } else {
            let userinfo = self.fetch_userinfo(provider, &tokens.access_token).await?;
            let mut identity = claims::normalize(&provider.id, &provider.claims, userinfo)?;
            if provider.adapter == ProviderAdapter::GitHub {
                self.attach_github_email(provider, &tokens.access_token, &mut identity)
                    .await;
            }
            identity
        };

        if let Some(user) = apple_user {
            if identity.name.is_none() {
                identity.name = user.full_name();
            }
            if let Value::Object(raw) = &mut identity.raw_claims {
                if let Ok(user_value) = serde_json::to_value(user) {
                    raw.insert("apple_user".to_string(), user_value);
                }
            }
        }

        LoggingHelper::log_identity_verified(&identity);
        Ok(identity)
    }

    /// Verify an ID token and return its claims
    ///
    /// # Errors
    ///
    /// See [`Self::verify`]
    pub async fn verify_id_token(
        &self,
        provider: &ProviderConfig,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<Value, VerificationError> {
        let (header_b64, payload_b64, signature_b64) = split_jwt(id_token)
            .map_err(|e| VerificationError::SignatureInvalid(e.to_string()))?;
        let header: JwsHeader = decode_jwt_segment(header_b64)
            .map_err(|e| VerificationError::SignatureInvalid(format!("header: {e}")))?;
        debug!("📋 ID token header for {}: alg={}, kid={:?}", provider.id, header.alg, header.kid);

        if !SUPPORTED_ALGORITHMS.contains(&header.alg.as_str()) {
            return Err(VerificationError::SignatureInvalid(format!(
                "unsupported algorithm {}",
                header.alg
            )));
        }

        let jwks_uri = provider
            .jwks_uri
            .as_deref()
            .ok_or_else(|| VerificationError::KeyUnavailable("no jwks_uri configured".to_string()))?;
        let key = self
            .jwks
            .get_key(&provider.id, jwks_uri, header.kid.as_deref())
            .await?;

        let signature = general_purpose::URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|e| VerificationError::SignatureInvalid(format!("signature encoding: {e}")))?;
        verify_signature(
            &format!("{header_b64}.{payload_b64}"),
            &signature,
            &header.alg,
            &key,
        )?;

        let claims: Value = decode_jwt_segment(payload_b64)
            .map_err(|e| VerificationError::claim("payload", e.to_string()))?;
        self.validate_claims(provider, &claims, expected_nonce)?;
        Ok(claims)
    }

    fn validate_claims(
        &self,
        provider: &ProviderConfig,
        claims: &Value,
        expected_nonce: &str,
    ) -> Result<(), VerificationError> {
        let now = Utc::now().timestamp();

        let issuer = claims.get("iss").and_then(Value::as_str);
        if issuer != provider.issuer.as_deref() {
            return Err(VerificationError::claim(
                "iss",
                format!("expected {:?}, got {issuer:?}", provider.issuer),
            ));
        }

        let audiences: Vec<&str> = match claims.get("aud") {
            Some(Value::String(aud)) => vec![aud.as_str()],
            Some(Value::Array(values)) => values.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !audiences.contains(&provider.client_id.as_str()) {
            return Err(VerificationError::claim("aud", "client id is not an audience"));
        }
        if audiences.len() > 1 {
            if let Some(azp) = claims.get("azp").and_then(Value::as_str) {
                if azp != provider.client_id {
                    return Err(VerificationError::claim("azp", "authorized party mismatch"));
                }
            }
        }

        let exp = claims
            .get("exp")
            .and_then(Value::as_i64)
            .ok_or_else(|| VerificationError::claim("exp", "missing"))?;
        if now >= exp.saturating_add(self.clock_skew) {
            return Err(VerificationError::claim("exp", "token has expired"));
        }
        if let Some(nbf) = claims.get("nbf").and_then(Value::as_i64) {
            if now.saturating_add(self.clock_skew) < nbf {
                return Err(VerificationError::claim("nbf", "token is not yet valid"));
            }
        }

        match claims.get("nonce").and_then(Value::as_str) {
            Some(nonce) if nonce == expected_nonce => Ok(()),
            Some(_) => Err(VerificationError::claim("nonce", "does not match the login attempt")),
            None => Err(VerificationError::claim("nonce", "missing")),
        }
    }

    async fn fetch_userinfo(
        &self,
        provider: &ProviderConfig,
        access_token: &str,
    ) -> Result<Value, VerificationError> {
        let endpoint = provider
            .userinfo_endpoint
            .as_deref()
            .ok_or_else(|| VerificationError::UserinfoFetch("no userinfo endpoint".to_string()))?;

        self.client
            .get_json(
                ProviderRequest::get(endpoint)
                    .bearer(access_token)
                    .header("Accept", "application/json"),
            )
            .await
            .map_err(|e| VerificationError::UserinfoFetch(e.to_string()))
    }

    /// GitHub keeps addresses at `/user/emails`; only the primary verified one is used
    async fn attach_github_email(
        &self,
        provider: &ProviderConfig,
        access_token: &str,
        identity: &mut VerifiedIdentity,
    ) {
        let Some(userinfo) = provider.userinfo_endpoint.as_deref() else {
            return;
        };
        let endpoint = format!("{}/emails", userinfo.trim_end_matches('/'));

        let emails = match self
            .client
            .get_json(
                ProviderRequest::get(&endpoint)
                    .bearer(access_token)
                    .header("Accept", "application/json"),
            )
            .await
        {
            Ok(value) => serde_json::from_value::<Vec<GitHubEmail>>(value).unwrap_or_default(),
            Err(e) => {
                warn!("Could not read GitHub emails for {}: {e}", provider.id);
                return;
            }
        };

        if let Some(primary) = emails.into_iter().find(|e| e.primary && e.verified) {
            identity.email = Some(primary.email);
            identity.email_verified = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fixtures::{self, TEST_PROVIDER_ID};
    use crate::testing::keys;
    use crate::testing::stub::StubTransport;
    use serde_json::json;
    use std::sync::Arc;

    const NONCE: &str = "nonce-123";

    fn setup() -> (IdentityVerifier, Arc<StubTransport>, crate::registry::ProviderRegistry) {
        let settings = fixtures::test_settings();
        let transport = Arc::new(StubTransport::new());
        transport.respond(fixtures::TEST_JWKS_URI, 200, &keys::test_jwks().to_string());
        let client = ProviderClient::new(transport.clone(), &settings.http);
        (
            IdentityVerifier::new(client, &settings.http),
            transport,
            fixtures::test_registry(&settings),
        )
    }

    fn tokens(id_token: Option<String>) -> ProviderTokens {
        ProviderTokens {
            access_token: "provider-access".to_string(),
            id_token,
            refresh_token: None,
            token_type: "Bearer".to_string(),
            expires_at: None,
            scope: None,
        }
    }

    #[tokio::test]
    async fn test_valid_id_token() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let token = keys::mint_id_token(&fixtures::id_token_claims(NONCE));

        let identity = verifier
            .verify(&provider, &tokens(Some(token)), NONCE, None)
            .await
            .unwrap();
        assert_eq!(identity.subject, fixtures::TEST_SUBJECT);
        assert_eq!(identity.email.as_deref(), Some(fixtures::TEST_EMAIL));
        assert_eq!(identity.provider_id, TEST_PROVIDER_ID);
    }

    #[tokio::test]
    async fn test_rs256_id_token() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let token = keys::mint_rs256_id_token(&fixtures::id_token_claims(NONCE));

        assert!(verifier
            .verify(&provider, &tokens(Some(token)), NONCE, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_foreign_key_signature_is_rejected() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let token = keys::mint_foreign_id_token(&fixtures::id_token_claims(NONCE));

        let err = verifier
            .verify(&provider, &tokens(Some(token)), NONCE, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn test_claim_mismatches() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();

        let cases = [
            ("iss", json!("https://other.test")),
            ("aud", json!("someone-else")),
            ("exp", json!(Utc::now().timestamp() - 3600)),
            ("nbf", json!(Utc::now().timestamp() + 3600)),
            ("nonce", json!("wrong")),
        ];
        for (claim, value) in cases {
            let mut claims = fixtures::id_token_claims(NONCE);
            claims[claim] = value;
            let token = keys::mint_id_token(&claims);

            let err = verifier
                .verify(&provider, &tokens(Some(token)), NONCE, None)
                .await
                .unwrap_err();
            assert!(
                matches!(err, VerificationError::ClaimInvalid { claim: ref c, .. } if c == claim),
                "expected {claim} failure, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_extreme_time_claims_do_not_overflow() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let mut claims = fixtures::id_token_claims(NONCE);
        claims["exp"] = json!(i64::MAX);
        claims["nbf"] = json!(i64::MIN);

        assert!(verifier
            .verify(&provider, &tokens(Some(keys::mint_id_token(&claims))), NONCE, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_audience_array() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let mut claims = fixtures::id_token_claims(NONCE);
        claims["aud"] = json!(["other", fixtures::TEST_CLIENT_ID]);
        claims["azp"] = json!(fixtures::TEST_CLIENT_ID);

        assert!(verifier
            .verify(&provider, &tokens(Some(keys::mint_id_token(&claims))), NONCE, None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_missing_id_token() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let err = verifier
            .verify(&provider, &tokens(None), NONCE, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::ClaimInvalid { .. }));
    }

    #[tokio::test]
    async fn test_jwks_unavailable() {
        let settings = fixtures::test_settings();
        let transport = Arc::new(StubTransport::new());
        transport.respond(fixtures::TEST_JWKS_URI, 503, "");
        let verifier = IdentityVerifier::new(
            ProviderClient::new(transport, &settings.http),
            &settings.http,
        );
        let registry = fixtures::test_registry(&settings);
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let token = keys::mint_id_token(&fixtures::id_token_claims(NONCE));

        let err = verifier
            .verify(&provider, &tokens(Some(token)), NONCE, None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::KeyUnavailable(_)));
    }

    #[tokio::test]
    async fn test_github_userinfo_with_primary_email() {
        let (verifier, transport, registry) = setup();
        transport.respond(
            fixtures::GITHUB_USER_ENDPOINT,
            200,
            r#"{"id": 583231, "login": "octocat", "name": "The Octocat"}"#,
        );
        transport.respond(
            fixtures::GITHUB_EMAILS_ENDPOINT,
            200,
            r#"[{"email":"old@example.com","primary":false,"verified":true},{"email":"octo@example.com","primary":true,"verified":true}]"#,
        );
        let provider = registry.lookup("github").unwrap();

        let identity = verifier
            .verify(&provider, &tokens(None), "", None)
            .await
            .unwrap();
        assert_eq!(identity.subject, "583231");
        assert_eq!(identity.email.as_deref(), Some("octo@example.com"));
        assert!(identity.email_verified);

        let request = transport.last_request(fixtures::GITHUB_USER_ENDPOINT).unwrap();
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer provider-access"));
    }

    #[tokio::test]
    async fn test_userinfo_failure() {
        let (verifier, transport, registry) = setup();
        transport.respond(fixtures::GITHUB_USER_ENDPOINT, 401, "");
        let provider = registry.lookup("github").unwrap();

        let err = verifier
            .verify(&provider, &tokens(None), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::UserinfoFetch(_)));
    }

    #[tokio::test]
    async fn test_apple_user_name_is_merged() {
        let (verifier, _, registry) = setup();
        let provider = registry.lookup(TEST_PROVIDER_ID).unwrap();
        let mut claims = fixtures::id_token_claims(NONCE);
        claims.as_object_mut().unwrap().remove("name");
        let user = AppleUserInfo::from_callback_value(&json!({
            "name": {"firstName": "Ada", "lastName": "Lovelace"},
            "email": "ada@example.com"
        }))
        .unwrap();

        let identity = verifier
            .verify(&provider, &tokens(Some(keys::mint_id_token(&claims))), NONCE, Some(&user))
            .await
            .unwrap();
        assert_eq!(identity.name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(identity.raw_claims["apple_user"]["email"], "ada@example.com");
    }
}
