//! Wiring of the broker's components
//!
//! [`Broker`] owns one instance of each component, built from settings. The
//! actix app holds it in `web::Data`; nothing here is global.

use crate::error::ConfigError;
use crate::oauth::exchange::AuthorizationCodeExchanger;
use crate::oauth::transport::{ProviderClient, ProviderTransport};
use crate::registry::ProviderRegistry;
use crate::session::{
    AccessTokenSigner, AuthActivityLog, AuthStateStore, CookieFactory, InMemoryAuthStateStore,
    InMemorySessionStore, InMemoryUserStore, SessionIssuer, SessionStore, SessionValidator,
    UserStore,
};
use crate::settings::BrokerSettings;
use crate::verify::IdentityVerifier;
use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use url::Url;

pub struct Broker {
    pub settings: BrokerSettings,
    pub registry: Arc<ProviderRegistry>,
    pub exchanger: AuthorizationCodeExchanger,
    pub verifier: IdentityVerifier,
    pub issuer: SessionIssuer,
    pub validator: SessionValidator,
    pub cookies: CookieFactory,
    pub activity: AuthActivityLog,
    states: Arc<dyn AuthStateStore>,
    sessions: Arc<dyn SessionStore>,
}

impl Broker {
    /// Build the provider registry (running OIDC discovery where configured)
    /// and every component on top of it, using in-memory stores
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` from provider resolution or discovery
    pub async fn from_settings(
        settings: BrokerSettings,
        transport: Arc<dyn ProviderTransport>,
    ) -> Result<Self, ConfigError> {
        let client = ProviderClient::new(transport, &settings.http);
        let registry = ProviderRegistry::from_settings(&settings, &client).await?;
        Self::with_registry(settings, registry, client)
    }

    /// Build the components around an existing registry
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the website base URL does not parse
    pub fn with_registry(
        settings: BrokerSettings,
        registry: ProviderRegistry,
        client: ProviderClient,
    ) -> Result<Self, ConfigError> {
        Self::with_stores(
            settings,
            registry,
            client,
            Arc::new(InMemoryAuthStateStore::new()),
            Arc::new(InMemorySessionStore::new()),
            Arc::new(InMemoryUserStore::new()),
        )
    }

    /// Build the components around an existing registry and storage backends
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidUrl` if the website base URL does not parse
    pub fn with_stores(
        settings: BrokerSettings,
        registry: ProviderRegistry,
        client: ProviderClient,
        states: Arc<dyn AuthStateStore>,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
    ) -> Result<Self, ConfigError> {
        let app = &settings.application;
        let website_origin =
            Url::parse(&app.website_base_url).map_err(|e| ConfigError::InvalidUrl {
                provider: "application".to_string(),
                field: "website_base_url".to_string(),
                reason: e.to_string(),
            })?;

        let signer = AccessTokenSigner::new(
            settings.session.secret.as_bytes(),
            settings.session.issuer_or(&app.public_base_url),
            settings.session.audience_or(&app.website_base_url),
            settings.session.access_token_ttl_seconds,
        );
        let cookies = CookieFactory::new(&settings.cookies, &app.api_base_path());
        let registry = Arc::new(registry);

        let exchanger = AuthorizationCodeExchanger::new(
            registry.clone(),
            states.clone(),
            client.clone(),
            settings.session.authorization_state_ttl_seconds,
            website_origin,
        );
        let verifier = IdentityVerifier::new(client, &settings.http);
        let issuer = SessionIssuer::new(
            users,
            sessions.clone(),
            signer.clone(),
            settings.session.refresh_token_ttl_hours,
            settings.session.link_accounts_by_verified_email,
        );
        let validator = SessionValidator::new(
            signer,
            sessions.clone(),
            cookies.access_cookie_name().to_string(),
        );

        info!(
            "🏭 Sign-in broker ready with {} provider(s) under {}",
            registry.len(),
            app.api_base_path()
        );

        Ok(Self {
            settings,
            registry,
            exchanger,
            verifier,
            issuer,
            validator,
            cookies,
            activity: AuthActivityLog::new(),
            states,
            sessions,
        })
    }

    /// Drop expired authorization states and expired refresh tokens
    pub async fn sweep_expired(&self) {
        let now = Utc::now();
        match self.states.purge_expired(now).await {
            Ok(0) => {}
            Ok(n) => debug!("🧹 Purged {n} expired authorization state(s)"),
            Err(e) => warn!("Authorization state sweep failed: {e}"),
        }
        match self.sessions.purge_expired(now).await {
            Ok(0) => {}
            Ok(n) => debug!("🧹 Purged {n} expired refresh token(s)"),
            Err(e) => warn!("Session sweep failed: {e}"),
        }
    }
}
