//! Provider registry
//!
//! An immutable map from provider id to [`ProviderConfig`], built once at
//! startup from settings (optionally resolving OIDC discovery documents) and
//! shared read-only through `Arc`.

pub mod adapter;

pub use adapter::ProviderAdapter;

use crate::error::ConfigError;
use crate::models::ProviderSummary;
use crate::oauth::client_secret::check_signing_key;
use crate::oauth::transport::{ProviderClient, ProviderRequest};
use crate::settings::{ApplicationSettings, BrokerSettings, ProviderSettings};
use crate::utils::logging::LoggingHelper;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// How the broker authenticates itself at the token endpoint
#[derive(Clone)]
pub enum ClientCredentials {
    Secret(String),
    /// Freshly signed ES256 client assertion per request (Apple)
    SignedAssertion {
        team_id: String,
        key_id: String,
        private_key_pem: String,
    },
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret(_) => f.write_str("Secret([redacted])"),
            Self::SignedAssertion { team_id, key_id, .. } => f
                .debug_struct("SignedAssertion")
                .field("team_id", team_id)
                .field("key_id", key_id)
                .field("private_key_pem", &"[redacted]")
                .finish(),
        }
    }
}

/// Where client credentials go in the token request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    /// `client_id` / `client_secret` form fields
    Post,
    /// HTTP Basic authorization header
    Basic,
}

impl ClientAuthMethod {
    fn parse(provider: &str, value: &str) -> Result<Self, ConfigError> {
        match value.to_ascii_lowercase().as_str() {
            "post" | "client_secret_post" => Ok(Self::Post),
            "basic" | "client_secret_basic" => Ok(Self::Basic),
            _ => Err(ConfigError::MissingField {
                provider: provider.to_string(),
                field: format!("client_auth (unknown method '{value}')"),
            }),
        }
    }
}

/// JSON-pointer paths used to normalize provider claims
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimMapping {
    pub subject: String,
    pub email: Option<String>,
    pub email_verified: Option<String>,
    /// Tried in order; the first non-empty string wins
    pub name: Vec<String>,
}

/// Static configuration of one identity provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub adapter: ProviderAdapter,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub issuer: Option<String>,
    pub scopes: Vec<String>,
    pub client_id: String,
    pub credentials: ClientCredentials,
    pub client_auth: ClientAuthMethod,
    pub use_pkce: bool,
    pub extra_auth_params: Vec<(String, String)>,
    pub claims: ClaimMapping,
    /// Callback URL registered with the provider
    pub redirect_uri: String,
}

/// Subset of an OpenID Provider Configuration document
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: String,
}

impl ProviderConfig {
    /// Resolve a provider from settings, adapter defaults and an optional discovery document
    ///
    /// Explicit settings win over discovery, which wins over adapter defaults.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for missing ids, endpoints or credentials, invalid
    /// URLs, inline secrets (unless allowed) and unusable signing keys
    pub fn from_settings(
        settings: &ProviderSettings,
        app: &ApplicationSettings,
        discovery: Option<&DiscoveryDocument>,
    ) -> Result<Self, ConfigError> {
        let id = settings.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigError::MissingField {
                provider: "<unnamed>".to_string(),
                field: "id".to_string(),
            });
        }

        let adapter = match &settings.adapter {
            Some(name) => ProviderAdapter::parse(name)?,
            None => ProviderAdapter::infer(&id, settings.discovery_url.is_some()),
        };
        let defaults = adapter.defaults();

        let authorization_endpoint = pick(
            settings.authorization_endpoint.as_deref(),
            discovery.map(|d| d.authorization_endpoint.as_str()),
            defaults.authorization_endpoint,
        );
        let token_endpoint = pick(
            settings.token_endpoint.as_deref(),
            discovery.map(|d| d.token_endpoint.as_str()),
            defaults.token_endpoint,
        );
        let userinfo_endpoint = pick(
            settings.userinfo_endpoint.as_deref(),
            discovery.and_then(|d| d.userinfo_endpoint.as_deref()),
            defaults.userinfo_endpoint,
        );
        let jwks_uri = pick(
            settings.jwks_uri.as_deref(),
            discovery.map(|d| d.jwks_uri.as_str()),
            defaults.jwks_uri,
        );
        let issuer = pick(
            settings.issuer.as_deref(),
            discovery.map(|d| d.issuer.as_str()),
            defaults.issuer,
        );

        let authorization_endpoint =
            require_url(&id, "authorization_endpoint", authorization_endpoint)?;
        let token_endpoint = require_url(&id, "token_endpoint", token_endpoint)?;
        let userinfo_endpoint = optional_url(&id, "userinfo_endpoint", userinfo_endpoint)?;
        let jwks_uri = optional_url(&id, "jwks_uri", jwks_uri)?;

        if adapter.is_oidc() {
            if jwks_uri.is_none() {
                return Err(missing(&id, "jwks_uri"));
            }
            if issuer.is_none() {
                return Err(missing(&id, "issuer"));
            }
        } else if userinfo_endpoint.is_none() {
            return Err(missing(&id, "userinfo_endpoint"));
        }

        let client_id = settings
            .get_client_id()
            .ok_or_else(|| missing(&id, "client_id"))?;
        let credentials = resolve_credentials(settings, &id, app.allow_inline_secrets)?;

        let client_auth = match &settings.client_auth {
            Some(method) => ClientAuthMethod::parse(&id, method)?,
            None => defaults.client_auth,
        };

        // Twitter rejects authorization requests without PKCE
        let use_pkce = adapter == ProviderAdapter::Twitter
            || settings.use_pkce.unwrap_or(defaults.use_pkce);

        let scopes = settings.scopes.clone().unwrap_or_else(|| {
            defaults
                .scopes
                .iter()
                .map(|s| (*s).to_string())
                .collect()
        });

        let mut extra_auth_params: Vec<(String, String)> = defaults
            .extra_auth_params
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .filter(|(k, _)| !settings.extra_auth_params.contains_key(k))
            .collect();
        let mut configured: Vec<_> = settings.extra_auth_params.clone().into_iter().collect();
        configured.sort();
        extra_auth_params.extend(configured);

        let mut claims = adapter.default_claims();
        if let Some(overrides) = &settings.claims {
            if let Some(subject) = &overrides.subject {
                claims.subject.clone_from(subject);
            }
            if overrides.email.is_some() {
                claims.email.clone_from(&overrides.email);
            }
            if overrides.email_verified.is_some() {
                claims.email_verified.clone_from(&overrides.email_verified);
            }
            if let Some(name) = &overrides.name {
                claims.name = vec![name.clone()];
            }
        }

        let display_name = settings
            .display_name
            .clone()
            .or_else(|| defaults.display_name.map(str::to_string))
            .unwrap_or_else(|| id.clone());

        Ok(Self {
            redirect_uri: app.callback_url(&id),
            id,
            display_name,
            adapter,
            authorization_endpoint,
            token_endpoint,
            userinfo_endpoint,
            jwks_uri,
            issuer,
            scopes,
            client_id,
            credentials,
            client_auth,
            use_pkce,
            extra_auth_params,
            claims,
        })
    }
}

fn resolve_credentials(
    settings: &ProviderSettings,
    id: &str,
    allow_inline: bool,
) -> Result<ClientCredentials, ConfigError> {
    if let Some(signing) = &settings.jwt_signing {
        let team_id = signing.get_team_id().ok_or_else(|| missing(id, "team_id"))?;
        let key_id = signing.get_key_id().ok_or_else(|| missing(id, "key_id"))?;
        let private_key_pem = signing
            .get_private_key_pem(id)?
            .ok_or_else(|| missing(id, "private_key_path"))?;
        check_signing_key(&private_key_pem).map_err(|reason| ConfigError::Secret {
            provider: id.to_string(),
            field: "private_key_path".to_string(),
            reason,
        })?;
        return Ok(ClientCredentials::SignedAssertion {
            team_id,
            key_id,
            private_key_pem,
        });
    }

    settings
        .get_client_secret(allow_inline)?
        .map(ClientCredentials::Secret)
        .ok_or_else(|| missing(id, "client_secret"))
}

fn pick(
    explicit: Option<&str>,
    discovered: Option<&str>,
    default: Option<&'static str>,
) -> Option<String> {
    explicit
        .or(discovered)
        .or(default)
        .map(str::to_string)
}

fn missing(provider: &str, field: &str) -> ConfigError {
    ConfigError::MissingField {
        provider: provider.to_string(),
        field: field.to_string(),
    }
}

fn require_url(provider: &str, field: &str, value: Option<String>) -> Result<String, ConfigError> {
    optional_url(provider, field, value)?.ok_or_else(|| missing(provider, field))
}

fn optional_url(
    provider: &str,
    field: &str,
    value: Option<String>,
) -> Result<Option<String>, ConfigError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed = url::Url::parse(&value).map_err(|e| ConfigError::InvalidUrl {
        provider: provider.to_string(),
        field: field.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "https" | "http") {
        return Err(ConfigError::InvalidUrl {
            provider: provider.to_string(),
            field: field.to_string(),
            reason: format!("unsupported scheme '{}'", parsed.scheme()),
        });
    }
    Ok(Some(value))
}

/// Collects providers and rejects duplicate ids
#[derive(Default, Debug)]
pub struct ProviderRegistryBuilder {
    providers: HashMap<String, Arc<ProviderConfig>>,
    order: Vec<String>,
}

impl ProviderRegistryBuilder {
    /// Add a provider
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateProvider` if the id is already registered
    pub fn register(&mut self, config: ProviderConfig) -> Result<&mut Self, ConfigError> {
        if self.providers.contains_key(&config.id) {
            return Err(ConfigError::DuplicateProvider(config.id));
        }
        self.order.push(config.id.clone());
        self.providers.insert(config.id.clone(), Arc::new(config));
        Ok(self)
    }

    #[must_use]
    pub fn build(self) -> ProviderRegistry {
        ProviderRegistry {
            providers: self.providers,
            order: self.order,
        }
    }
}

/// Immutable provider lookup
#[derive(Debug, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<ProviderConfig>>,
    order: Vec<String>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn builder() -> ProviderRegistryBuilder {
        ProviderRegistryBuilder::default()
    }

    /// Build the registry from settings, fetching discovery documents where configured
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` encountered; a broker with a broken
    /// provider configuration must not start
    pub async fn from_settings(
        settings: &BrokerSettings,
        client: &ProviderClient,
    ) -> Result<Self, ConfigError> {
        LoggingHelper::log_provider_initialization();
        let mut builder = Self::builder();

        for provider_settings in &settings.providers {
            if !provider_settings.enabled {
                LoggingHelper::log_provider_disabled(&provider_settings.id);
                continue;
            }

            let discovery = match &provider_settings.discovery_url {
                Some(url) => Some(fetch_discovery(&provider_settings.id, url, client).await?),
                None => None,
            };

            let config = ProviderConfig::from_settings(
                provider_settings,
                &settings.application,
                discovery.as_ref(),
            )?;
            LoggingHelper::log_provider_configured(&config);
            builder.register(config)?;
        }

        let registry = builder.build();
        if registry.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        LoggingHelper::log_providers_summary(&registry.order);
        Ok(registry)
    }

    /// Look up a provider by id
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownProvider` if no provider has this id
    pub fn lookup(&self, id: &str) -> Result<Arc<ProviderConfig>, ConfigError> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownProvider(id.to_string()))
    }

    /// Providers in configuration order
    #[must_use]
    pub fn summaries(&self) -> Vec<ProviderSummary> {
        self.order
            .iter()
            .filter_map(|id| self.providers.get(id))
            .map(|p| ProviderSummary {
                id: p.id.clone(),
                display_name: p.display_name.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

async fn fetch_discovery(
    provider: &str,
    url: &str,
    client: &ProviderClient,
) -> Result<DiscoveryDocument, ConfigError> {
    log::debug!("Fetching discovery document for {provider} from: {url}");
    let document = client
        .get_json(ProviderRequest::get(url).header("Accept", "application/json"))
        .await
        .map_err(|e| ConfigError::Discovery {
            provider: provider.to_string(),
            reason: e.to_string(),
        })?;

    serde_json::from_value(document).map_err(|e| ConfigError::Discovery {
        provider: provider.to_string(),
        reason: format!("invalid discovery document: {e}"),
    })
}
