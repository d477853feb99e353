//! Authorization code flow
//!
//! `begin_login` creates a single-use authorization state and the provider
//! redirect URL; `complete_login` consumes that state and trades the code for
//! provider tokens.

use crate::error::{BrokerError, FlowError};
use crate::models::{AuthorizationRequestState, ProviderTokens};
use crate::oauth::client_secret::generate_client_assertion;
use crate::oauth::pkce;
use crate::oauth::transport::{ProviderClient, ProviderRequest};
use crate::registry::{ClientAuthMethod, ClientCredentials, ProviderConfig, ProviderRegistry};
use crate::session::store::AuthStateStore;
use crate::settings::ttl_from_seconds;
use crate::utils::crypto::generate_state;
use crate::utils::logging::LoggingHelper;
use crate::utils::redirect::validate_post_login_redirect;
use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

/// Token endpoint response, success or error shaped
#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: Option<String>,
    id_token: Option<String>,
    refresh_token: Option<String>,
    token_type: Option<String>,
    expires_in: Option<i64>,
    scope: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl TokenEndpointResponse {
    fn into_tokens(self, provider: &str, now: DateTime<Utc>) -> Result<ProviderTokens, FlowError> {
        // GitHub reports exchange failures with a 200 and an `error` field
        if let Some(error) = self.error {
            let reason = match self.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            };
            return Err(exchange_error(provider, reason));
        }

        let access_token = self
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| exchange_error(provider, "response has no access_token"))?;

        let expires_at = match self.expires_in {
            Some(secs) => Some(
                Duration::try_seconds(secs)
                    .and_then(|lifetime| now.checked_add_signed(lifetime))
                    .ok_or_else(|| exchange_error(provider, "expires_in is out of range"))?,
            ),
            None => None,
        };

        Ok(ProviderTokens {
            access_token,
            id_token: self.id_token,
            refresh_token: self.refresh_token,
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at,
            scope: self.scope,
        })
    }
}

fn exchange_error(provider: &str, reason: impl Into<String>) -> FlowError {
    FlowError::ProviderExchange {
        provider: provider.to_string(),
        reason: reason.into(),
    }
}

pub struct AuthorizationCodeExchanger {
    registry: Arc<ProviderRegistry>,
    states: Arc<dyn AuthStateStore>,
    client: ProviderClient,
    state_ttl: Duration,
    website_origin: Url,
}

impl AuthorizationCodeExchanger {
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        states: Arc<dyn AuthStateStore>,
        client: ProviderClient,
        state_ttl_seconds: u64,
        website_origin: Url,
    ) -> Self {
        Self {
            registry,
            states,
            client,
            state_ttl: ttl_from_seconds(state_ttl_seconds),
            website_origin,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Start a login with `provider_id`
    ///
    /// An unsafe `redirect_to` is dropped rather than rejected, so the user
    /// lands on the default page after sign-in.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownProvider` for unregistered providers
    /// - `FlowError::Store` if the state cannot be persisted
    pub async fn begin_login(
        &self,
        provider_id: &str,
        redirect_to: Option<&str>,
    ) -> Result<(String, AuthorizationRequestState), BrokerError> {
        let provider = self.registry.lookup(provider_id)?;
        let now = Utc::now();

        let redirect_to = redirect_to.and_then(|target| {
            let validated = validate_post_login_redirect(target, &self.website_origin);
            if validated.is_none() {
                warn!("Ignoring unsafe post-login redirect for {provider_id}");
            }
            validated
        });

        let state = AuthorizationRequestState {
            state: generate_state(),
            provider_id: provider.id.clone(),
            nonce: generate_state(),
            pkce_verifier: provider.use_pkce.then(pkce::generate_verifier),
            redirect_to,
            created_at: now,
            expires_at: now + self.state_ttl,
        };

        let url = build_authorization_url(&provider, &state)?;
        self.states.put(state.clone()).await.map_err(FlowError::from)?;

        LoggingHelper::log_authorization_url_built(&provider.id, &provider.scopes, provider.use_pkce);
        Ok((url, state))
    }

    /// Finish a login: consume the state and exchange `code` for tokens
    ///
    /// The state is removed before any other check, so it is single use even
    /// when the exchange fails.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownProvider` for unregistered providers
    /// - `FlowError::StateMismatch` for unknown, used or cross-provider states
    /// - `FlowError::StateExpired` when `now >= expires_at`
    /// - `FlowError::ProviderExchange` for transport, status or body failures
    pub async fn complete_login(
        &self,
        provider_id: &str,
        code: &str,
        returned_state: &str,
    ) -> Result<(ProviderTokens, AuthorizationRequestState), BrokerError> {
        let provider = self.registry.lookup(provider_id)?;

        let state = self
            .states
            .take(returned_state)
            .await
            .map_err(FlowError::from)?
            .ok_or(FlowError::StateMismatch)?;

        if state.provider_id != provider.id {
            debug!(
                "State issued for {} presented on the {} callback",
                state.provider_id, provider.id
            );
            return Err(FlowError::StateMismatch.into());
        }
        let now = Utc::now();
        if state.is_expired_at(now) {
            return Err(FlowError::StateExpired.into());
        }

        LoggingHelper::log_token_exchange_start(&provider.id);
        let request = build_token_request(&provider, code, state.pkce_verifier.as_deref())?;

        let response = self
            .client
            .send_once(request)
            .await
            .map_err(|e| exchange_error(&provider.id, e.to_string()))?;
        if !response.is_success() {
            debug!(
                "Token endpoint for {} answered {}: {}",
                provider.id, response.status, response.body
            );
            return Err(exchange_error(&provider.id, format!("status {}", response.status)).into());
        }

        let body: TokenEndpointResponse = serde_json::from_str(&response.body)
            .map_err(|e| exchange_error(&provider.id, format!("malformed token response: {e}")))?;
        let tokens = body.into_tokens(&provider.id, now)?;

        LoggingHelper::log_token_exchange_summary(&provider.id, &tokens);
        Ok((tokens, state))
    }
}

fn build_authorization_url(
    provider: &ProviderConfig,
    state: &AuthorizationRequestState,
) -> Result<String, FlowError> {
    let mut url = Url::parse(&provider.authorization_endpoint)
        .map_err(|e| exchange_error(&provider.id, format!("authorization endpoint: {e}")))?;

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &provider.client_id)
            .append_pair("redirect_uri", &provider.redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &provider.scopes.join(" "))
            .append_pair("state", &state.state);

        if provider.adapter.is_oidc() {
            query.append_pair("nonce", &state.nonce);
        }
        if let Some(verifier) = &state.pkce_verifier {
            query
                .append_pair("code_challenge", &pkce::challenge_for(verifier))
                .append_pair("code_challenge_method", pkce::CHALLENGE_METHOD);
        }
        for (name, value) in &provider.extra_auth_params {
            query.append_pair(name, value);
        }
    }

    Ok(url.into())
}

fn build_token_request(
    provider: &ProviderConfig,
    code: &str,
    pkce_verifier: Option<&str>,
) -> Result<ProviderRequest, FlowError> {
    let client_secret = match &provider.credentials {
        ClientCredentials::Secret(secret) => secret.clone(),
        ClientCredentials::SignedAssertion {
            team_id,
            key_id,
            private_key_pem,
        } => generate_client_assertion(team_id, key_id, &provider.client_id, private_key_pem)?,
    };

    let mut form = vec![
        ("grant_type".to_string(), "authorization_code".to_string()),
        ("code".to_string(), code.to_string()),
        ("redirect_uri".to_string(), provider.redirect_uri.clone()),
    ];
    if let Some(verifier) = pkce_verifier {
        form.push(("code_verifier".to_string(), verifier.to_string()));
    }

    let request = match provider.client_auth {
        ClientAuthMethod::Post => {
            form.push(("client_id".to_string(), provider.client_id.clone()));
            form.push(("client_secret".to_string(), client_secret));
            ProviderRequest::post_form(&provider.token_endpoint, form)
        }
        ClientAuthMethod::Basic => ProviderRequest::post_form(&provider.token_endpoint, form)
            .basic_auth(&provider.client_id, &client_secret),
    };

    Ok(if provider.adapter.wants_json_accept() {
        request.header("Accept", "application/json")
    } else {
        request
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::store::InMemoryAuthStateStore;
    use crate::testing::fixtures::{self, TEST_PROVIDER_ID};
    use crate::testing::stub::StubTransport;

    fn exchanger(transport: Arc<StubTransport>) -> (AuthorizationCodeExchanger, Arc<InMemoryAuthStateStore>) {
        let settings = fixtures::test_settings();
        let states = Arc::new(InMemoryAuthStateStore::new());
        let exchanger = AuthorizationCodeExchanger::new(
            Arc::new(fixtures::test_registry(&settings)),
            states.clone(),
            ProviderClient::new(transport, &settings.http),
            600,
            Url::parse(&settings.application.website_base_url).unwrap(),
        );
        (exchanger, states)
    }

    fn token_body() -> String {
        serde_json::json!({
            "access_token": "provider-access",
            "id_token": "a.b.c",
            "token_type": "Bearer",
            "expires_in": 3600
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_begin_login_builds_authorization_url() {
        let (exchanger, states) = exchanger(Arc::new(StubTransport::new()));
        let (url, state) = exchanger
            .begin_login(TEST_PROVIDER_ID, Some("/dashboard"))
            .await
            .unwrap();

        let parsed = Url::parse(&url).unwrap();
        let query: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(query["client_id"], fixtures::TEST_CLIENT_ID);
        assert_eq!(query["response_type"], "code");
        assert_eq!(query["state"], state.state);
        assert_eq!(query["nonce"], state.nonce);
        assert_eq!(query["code_challenge_method"], "S256");
        assert_eq!(
            query["code_challenge"],
            pkce::challenge_for(state.pkce_verifier.as_deref().unwrap())
        );
        assert_eq!(
            query["redirect_uri"],
            "http://localhost:3001/auth/callback/test"
        );
        assert_eq!(state.redirect_to.as_deref(), Some("/dashboard"));
        assert_eq!(states.len(), 1);
    }

    #[tokio::test]
    async fn test_begin_login_drops_offsite_redirect() {
        let (exchanger, _) = exchanger(Arc::new(StubTransport::new()));
        let (_, state) = exchanger
            .begin_login(TEST_PROVIDER_ID, Some("https://evil.example/phish"))
            .await
            .unwrap();
        assert!(state.redirect_to.is_none());
    }

    #[tokio::test]
    async fn test_unknown_provider() {
        let (exchanger, _) = exchanger(Arc::new(StubTransport::new()));
        let err = exchanger.begin_login("nope", None).await.unwrap_err();
        assert_eq!(err.code(), "unsupported_provider");
    }

    #[tokio::test]
    async fn test_complete_login_is_single_use() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(fixtures::TEST_TOKEN_ENDPOINT, 200, &token_body());
        let (exchanger, _) = exchanger(transport.clone());

        let (_, state) = exchanger.begin_login(TEST_PROVIDER_ID, None).await.unwrap();
        let (tokens, consumed) = exchanger
            .complete_login(TEST_PROVIDER_ID, "code-1", &state.state)
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "provider-access");
        assert_eq!(consumed.nonce, state.nonce);

        let request = transport.last_request(fixtures::TEST_TOKEN_ENDPOINT).unwrap();
        assert_eq!(request.form_value("code"), Some("code-1"));
        assert_eq!(
            request.form_value("code_verifier"),
            state.pkce_verifier.as_deref()
        );
        assert_eq!(request.form_value("client_secret"), Some(fixtures::TEST_CLIENT_SECRET));

        let second = exchanger
            .complete_login(TEST_PROVIDER_ID, "code-1", &state.state)
            .await
            .unwrap_err();
        assert!(matches!(second, BrokerError::Flow(FlowError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected_and_consumed() {
        let (exchanger, states) = exchanger(Arc::new(StubTransport::new()));
        let now = Utc::now();
        states
            .put(AuthorizationRequestState {
                state: "stale".to_string(),
                provider_id: TEST_PROVIDER_ID.to_string(),
                nonce: "n".to_string(),
                pkce_verifier: None,
                redirect_to: None,
                created_at: now - Duration::seconds(600),
                expires_at: now,
            })
            .await
            .unwrap();

        let err = exchanger
            .complete_login(TEST_PROVIDER_ID, "any-code", "stale")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Flow(FlowError::StateExpired)));
        assert!(states.is_empty());
    }

    #[tokio::test]
    async fn test_state_bound_to_provider() {
        let (exchanger, _) = exchanger(Arc::new(StubTransport::new()));
        let (_, state) = exchanger.begin_login(TEST_PROVIDER_ID, None).await.unwrap();

        let err = exchanger
            .complete_login("github", "code", &state.state)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Flow(FlowError::StateMismatch)));
    }

    #[tokio::test]
    async fn test_token_endpoint_failures() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(fixtures::TEST_TOKEN_ENDPOINT, 400, r#"{"error":"invalid_grant"}"#);
        let (exchanger, _) = exchanger(transport.clone());

        let (_, state) = exchanger.begin_login(TEST_PROVIDER_ID, None).await.unwrap();
        let err = exchanger
            .complete_login(TEST_PROVIDER_ID, "bad", &state.state)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Flow(FlowError::ProviderExchange { .. })
        ));
        assert_eq!(transport.request_count(fixtures::TEST_TOKEN_ENDPOINT), 1);

        transport.respond(fixtures::TEST_TOKEN_ENDPOINT, 200, "not json");
        let (_, state) = exchanger.begin_login(TEST_PROVIDER_ID, None).await.unwrap();
        let err = exchanger
            .complete_login(TEST_PROVIDER_ID, "code", &state.state)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "auth_failed");
    }

    #[tokio::test]
    async fn test_out_of_range_expires_in_is_an_exchange_error() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(
            fixtures::TEST_TOKEN_ENDPOINT,
            200,
            &serde_json::json!({"access_token": "x", "expires_in": i64::MAX}).to_string(),
        );
        let (exchanger, _) = exchanger(transport);

        let (_, state) = exchanger.begin_login(TEST_PROVIDER_ID, None).await.unwrap();
        let err = exchanger
            .complete_login(TEST_PROVIDER_ID, "code", &state.state)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Flow(FlowError::ProviderExchange { ref reason, .. }) if reason.contains("expires_in")
        ));
    }

    #[tokio::test]
    async fn test_github_error_in_success_body() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(
            fixtures::GITHUB_TOKEN_ENDPOINT,
            200,
            r#"{"error":"bad_verification_code","error_description":"The code passed is incorrect or expired."}"#,
        );
        let (exchanger, _) = exchanger(transport.clone());

        let (_, state) = exchanger.begin_login("github", None).await.unwrap();
        let err = exchanger
            .complete_login("github", "code", &state.state)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::Flow(FlowError::ProviderExchange { ref reason, .. }) if reason.starts_with("bad_verification_code")
        ));

        let request = transport.last_request(fixtures::GITHUB_TOKEN_ENDPOINT).unwrap();
        assert!(request
            .headers
            .iter()
            .any(|(k, v)| k == "Accept" && v == "application/json"));
    }
}
