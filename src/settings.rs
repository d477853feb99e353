use crate::error::ConfigError;
use base64::{engine::general_purpose, Engine as _};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable naming a directory that may hold a higher-priority `Settings.toml`
pub const SECRETS_DIR_ENV: &str = "BROKER_SECRETS_DIR";

/// Upper bound for every configured lifetime (ten years)
pub const MAX_TTL_SECONDS: u64 = 10 * 365 * 24 * 3600;

/// A configured lifetime as a `chrono::Duration`, capped at `MAX_TTL_SECONDS`
#[must_use]
pub fn ttl_from_seconds(seconds: u64) -> chrono::Duration {
    chrono::Duration::try_seconds(i64::try_from(seconds.min(MAX_TTL_SECONDS)).unwrap_or(0))
        .unwrap_or_else(chrono::Duration::zero)
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BrokerSettings {
    pub application: ApplicationSettings,
    pub session: SessionSettings,
    pub cookies: CookieSettings,
    pub http: HttpSettings,
    pub logging: LoggingSettings,
    pub providers: Vec<ProviderSettings>,
}

/// Application metadata: who we are and where the website lives
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationSettings {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    /// Public origin of this API (used for provider callback URLs)
    pub public_base_url: String,
    /// Origin of the website that starts sign-in and receives the user afterwards
    pub website_base_url: String,
    /// Path prefix for the broker's routes on the API domain
    pub api_base_path: String,
    /// Path of the website's sign-in page; failed logins are sent here with `?error=`
    pub website_base_path: String,
    /// Website path users land on after sign-in when no `rd` was given
    pub post_login_path: String,
    /// Comma separated extra CORS origins; the website origin is always allowed
    pub cors_origins: String,
    /// Development only: accept secrets written directly into `Settings.toml`
    pub allow_inline_secrets: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// HMAC key for first-party access tokens
    pub secret: String,
    /// `iss` of issued access tokens; defaults to the public base URL
    pub issuer: Option<String>,
    /// `aud` of issued access tokens; defaults to the website base URL
    pub audience: Option<String>,
    pub access_token_ttl_seconds: u64,
    pub refresh_token_ttl_hours: u64,
    pub authorization_state_ttl_seconds: u64,
    /// Interval of the background sweep of expired states and refresh tokens. 0 disables it.
    pub sweep_interval_seconds: u64,
    /// Link a new provider identity to an existing user with the same verified email
    pub link_accounts_by_verified_email: bool,
    /// Also return issued tokens in `x-access-token` / `x-refresh-token` headers
    pub expose_token_headers: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CookieSettings {
    pub secure: bool,
    pub access_cookie_name: String,
    pub refresh_cookie_name: String,
    /// `Strict`, `Lax` or `None`
    pub same_site: String,
    pub domain: Option<String>,
}

/// Outbound HTTP behaviour towards identity providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// Extra attempts for idempotent GETs (userinfo, JWKS, discovery)
    pub idempotent_retries: u32,
    pub retry_backoff_ms: u64,
    pub jwks_cache_seconds: u64,
    pub clock_skew_seconds: u64,
    pub user_agent: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub id: String,
    pub display_name: Option<String>,
    /// `google`, `apple`, `github`, `twitter`, `oidc` or `oauth2`; defaults from the id
    pub adapter: Option<String>,
    pub enabled: bool,

    pub discovery_url: Option<String>,
    pub authorization_endpoint: Option<String>,
    pub token_endpoint: Option<String>,
    pub userinfo_endpoint: Option<String>,
    pub jwks_uri: Option<String>,
    pub issuer: Option<String>,
    pub scopes: Option<Vec<String>>,

    pub client_id: Option<String>,
    pub client_id_env: Option<String>,

    /// Rejected unless `application.allow_inline_secrets` is set
    pub client_secret: Option<String>,
    pub client_secret_env: Option<String>,
    pub client_secret_file: Option<String>,

    /// `post` or `basic`; defaults per adapter
    pub client_auth: Option<String>,
    pub use_pkce: Option<bool>,
    pub extra_auth_params: HashMap<String, String>,

    /// Signed client assertion material (Apple)
    pub jwt_signing: Option<JwtSigningConfig>,

    /// JSON-pointer overrides for normalizing provider claims
    pub claims: Option<ClaimMappingSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JwtSigningConfig {
    pub team_id: Option<String>,
    pub key_id: Option<String>,
    pub private_key_path: Option<String>,

    pub team_id_env: Option<String>,
    pub key_id_env: Option<String>,
    pub private_key_path_env: Option<String>,
    /// Environment variable holding the PEM itself
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ClaimMappingSettings {
    pub subject: Option<String>,
    pub email: Option<String>,
    pub email_verified: Option<String>,
    pub name: Option<String>,
}

impl Default for ApplicationSettings {
    fn default() -> Self {
        Self {
            app_name: "Sign-in Broker".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3001,
            public_base_url: "http://localhost:3001".to_string(),
            website_base_url: "http://localhost:3000".to_string(),
            api_base_path: "/auth".to_string(),
            website_base_path: "/auth".to_string(),
            post_login_path: "/".to_string(),
            cors_origins: String::new(),
            allow_inline_secrets: false,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            secret: String::new(), // Generated at load if empty
            issuer: None,
            audience: None,
            access_token_ttl_seconds: 3600,
            refresh_token_ttl_hours: 720,
            authorization_state_ttl_seconds: 600,
            sweep_interval_seconds: 60,
            link_accounts_by_verified_email: false,
            expose_token_headers: true,
        }
    }
}

impl Default for CookieSettings {
    fn default() -> Self {
        Self {
            secure: true,
            access_cookie_name: "sAccessToken".to_string(),
            refresh_cookie_name: "sRefreshToken".to_string(),
            same_site: "Lax".to_string(),
            domain: None,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_seconds: 10,
            connect_timeout_seconds: 5,
            idempotent_retries: 2,
            retry_backoff_ms: 200,
            jwks_cache_seconds: 3600,
            clock_skew_seconds: 60,
            user_agent: concat!("signin-broker/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: None,
            adapter: None,
            enabled: true,
            discovery_url: None,
            authorization_endpoint: None,
            token_endpoint: None,
            userinfo_endpoint: None,
            jwks_uri: None,
            issuer: None,
            scopes: None,
            client_id: None,
            client_id_env: None,
            client_secret: None,
            client_secret_env: None,
            client_secret_file: None,
            client_auth: None,
            use_pkce: None,
            extra_auth_params: HashMap::new(),
            jwt_signing: None,
            claims: None,
        }
    }
}

impl BrokerSettings {
    /// Load settings from configuration files and environment variables
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. `Settings.toml` in `BROKER_SECRETS_DIR` (if set and present)
    /// 3. `Settings.toml` in the current directory
    /// 4. Defaults
    ///
    /// A `.env` file in the current directory is loaded first, and logging is
    /// initialized once the log level is known.
    ///
    /// # Errors
    ///
    /// Returns an error if a settings file exists but cannot be read or parsed,
    /// or if a session lifetime exceeds `MAX_TTL_SECONDS`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_env_file();

        let mut settings = Self::load_base_settings()?;
        Self::apply_env_overrides(&mut settings);

        init_logging(&settings.logging.level);
        settings.session.validate()?;
        Self::handle_session_secret(&mut settings.session);

        Ok(settings)
    }

    /// Parse settings from a TOML string without touching the environment
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` on invalid TOML
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        basic_toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn load_base_settings() -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        let default_config_path = PathBuf::from("Settings.toml");
        if default_config_path.exists() {
            settings = Self::read_file(&default_config_path)?;
            println!(
                "✓ Loaded base settings from {}",
                default_config_path.display()
            );
        }

        if let Ok(secrets_dir) = std::env::var(SECRETS_DIR_ENV) {
            let secrets_path = Path::new(&secrets_dir).join("Settings.toml");
            if secrets_path.exists() {
                settings = Self::read_file(&secrets_path)?;
                println!("✓ Overriding settings from {}", secrets_path.display());
            } else {
                println!(
                    "ℹ {SECRETS_DIR_ENV} set but no Settings.toml found at: {}",
                    secrets_path.display()
                );
            }
        }

        Ok(settings)
    }

    fn read_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    fn apply_env_overrides(settings: &mut Self) {
        Self::apply_application_env_overrides(&mut settings.application);
        Self::apply_session_env_overrides(&mut settings.session);
        Self::apply_cookie_env_overrides(&mut settings.cookies);
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            settings.logging.level = log_level;
        }
    }

    fn apply_application_env_overrides(app_settings: &mut ApplicationSettings) {
        if let Ok(host) = std::env::var("HOST") {
            app_settings.host = host;
        }
        if let Ok(Ok(port)) = std::env::var("PORT").map(|p| p.parse::<u16>()) {
            app_settings.port = port;
        }
        if let Ok(public_base_url) = std::env::var("PUBLIC_BASE_URL") {
            app_settings.public_base_url = public_base_url;
        }
        if let Ok(website_base_url) = std::env::var("WEBSITE_BASE_URL") {
            app_settings.website_base_url = website_base_url;
        }
        if let Ok(cors_origins) = std::env::var("CORS_ORIGINS") {
            app_settings.cors_origins = cors_origins;
        }
    }

    /// Apply environment overrides for session settings
    pub fn apply_session_env_overrides(session_settings: &mut SessionSettings) {
        Self::apply_numeric_env_override(
            "ACCESS_TOKEN_TTL_SECONDS",
            &mut session_settings.access_token_ttl_seconds,
        );
        Self::apply_numeric_env_override(
            "REFRESH_TOKEN_TTL_HOURS",
            &mut session_settings.refresh_token_ttl_hours,
        );
        if let Ok(secret) = std::env::var("SESSION_SECRET") {
            if !secret.is_empty() {
                session_settings.secret = secret;
            }
        }
    }

    fn apply_numeric_env_override(env_var: &str, target: &mut u64) {
        if let Ok(value_str) = std::env::var(env_var) {
            match value_str.parse::<u64>() {
                Ok(value) => *target = value,
                Err(_) => eprintln!("⚠️  Ignoring non-numeric {env_var}={value_str}"),
            }
        }
    }

    fn apply_cookie_env_overrides(cookie_settings: &mut CookieSettings) {
        if let Ok(Ok(cookie_secure)) = std::env::var("COOKIE_SECURE").map(|v| v.parse::<bool>()) {
            cookie_settings.secure = cookie_secure;
        }
    }

    /// Generate a random session secret when none is configured
    pub fn handle_session_secret(session_settings: &mut SessionSettings) {
        if session_settings.secret.is_empty() {
            session_settings.secret = Self::generate_random_session_secret();
            warn!("⚠️  Using auto-generated session secret");
            warn!("🔒 For production use, set SESSION_SECRET or session.secret in Settings.toml");
            warn!("💡 Issued sessions will not survive a restart");
        }
    }

    fn generate_random_session_secret() -> String {
        use rand::RngCore;
        let mut secret = [0u8; 32];
        rand::rng().fill_bytes(&mut secret);
        general_purpose::STANDARD.encode(secret)
    }

    /// Load environment variables from `.env`, skipping comments and keys already set
    fn load_env_file() {
        if let Ok(contents) = fs::read_to_string(".env") {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    let key = key.trim();
                    if std::env::var_os(key).is_none() {
                        std::env::set_var(key, value.trim().trim_matches('"'));
                    }
                }
            }
        }
    }

    #[must_use]
    pub fn get_bind_address(&self) -> String {
        format!("{}:{}", self.application.host, self.application.port)
    }

    /// Allowed CORS origins: the website origin plus any configured extras
    #[must_use]
    pub fn get_cors_origins(&self) -> Vec<String> {
        let website = self.application.website_base_url.trim_end_matches('/');
        let mut origins = vec![website.to_string()];
        origins.extend(
            self.application
                .cors_origins
                .split(',')
                .map(|s| s.trim().trim_end_matches('/').to_string())
                .filter(|s| !s.is_empty() && s != website),
        );
        origins
    }

    #[must_use]
    pub fn get_enabled_providers(&self) -> Vec<&ProviderSettings> {
        self.providers.iter().filter(|p| p.enabled).collect()
    }
}

impl ApplicationSettings {
    /// Normalized API base path: leading slash, no trailing slash (`/auth`)
    #[must_use]
    pub fn api_base_path(&self) -> String {
        normalize_base_path(&self.api_base_path)
    }

    /// Provider callback URL registered with the identity provider
    #[must_use]
    pub fn callback_url(&self, provider_id: &str) -> String {
        format!(
            "{}{}/callback/{provider_id}",
            self.public_base_url.trim_end_matches('/'),
            self.api_base_path()
        )
    }

    /// Website sign-in page; failed logins redirect here
    #[must_use]
    pub fn website_login_url(&self) -> String {
        format!(
            "{}{}",
            self.website_base_url.trim_end_matches('/'),
            normalize_base_path(&self.website_base_path)
        )
    }

    /// Default landing page after a successful login
    #[must_use]
    pub fn post_login_url(&self) -> String {
        format!(
            "{}{}",
            self.website_base_url.trim_end_matches('/'),
            normalize_base_path(&self.post_login_path)
        )
    }
}

impl SessionSettings {
    #[must_use]
    pub fn issuer_or(&self, fallback: &str) -> String {
        self.issuer.clone().unwrap_or_else(|| fallback.to_string())
    }

    #[must_use]
    pub fn audience_or(&self, fallback: &str) -> String {
        self.audience.clone().unwrap_or_else(|| fallback.to_string())
    }

    /// Reject lifetimes too long to add to the current time
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSetting` naming the first out-of-range field
    pub fn validate(&self) -> Result<(), ConfigError> {
        let lifetimes = [
            ("access_token_ttl_seconds", self.access_token_ttl_seconds),
            (
                "refresh_token_ttl_hours",
                self.refresh_token_ttl_hours.saturating_mul(3600),
            ),
            (
                "authorization_state_ttl_seconds",
                self.authorization_state_ttl_seconds,
            ),
        ];
        for (field, seconds) in lifetimes {
            if seconds > MAX_TTL_SECONDS {
                return Err(ConfigError::InvalidSetting {
                    field: format!("session.{field}"),
                    reason: format!("longer than {MAX_TTL_SECONDS} seconds"),
                });
            }
        }
        Ok(())
    }
}

impl ProviderSettings {
    /// Client id, environment variable first, then the direct value
    #[must_use]
    pub fn get_client_id(&self) -> Option<String> {
        env_first(self.client_id_env.as_ref(), self.client_id.as_ref())
    }

    /// Client secret from the environment, a file, or (if allowed) inline
    ///
    /// # Errors
    ///
    /// - `ConfigError::Secret` if the secret file cannot be read
    /// - `ConfigError::InlineSecret` if only an inline secret exists and inline secrets are disallowed
    pub fn get_client_secret(&self, allow_inline: bool) -> Result<Option<String>, ConfigError> {
        if let Some(value) = self
            .client_secret_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
        {
            return Ok(Some(value));
        }

        if let Some(path) = &self.client_secret_file {
            return fs::read_to_string(path)
                .map(|s| Some(s.trim().to_string()))
                .map_err(|e| ConfigError::Secret {
                    provider: self.id.clone(),
                    field: "client_secret_file".to_string(),
                    reason: e.to_string(),
                });
        }

        match &self.client_secret {
            Some(_) if !allow_inline => Err(ConfigError::InlineSecret {
                provider: self.id.clone(),
                field: "client_secret".to_string(),
            }),
            Some(secret) => {
                warn!(
                    "Provider '{}' uses an inline client_secret; do not do this in production",
                    self.id
                );
                Ok(Some(secret.clone()))
            }
            None => Ok(None),
        }
    }
}

impl JwtSigningConfig {
    #[must_use]
    pub fn get_team_id(&self) -> Option<String> {
        env_first(self.team_id_env.as_ref(), self.team_id.as_ref())
    }

    #[must_use]
    pub fn get_key_id(&self) -> Option<String> {
        env_first(self.key_id_env.as_ref(), self.key_id.as_ref())
    }

    /// PEM private key from `private_key_env` or from the file at the configured path
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Secret` if the key file cannot be read
    pub fn get_private_key_pem(&self, provider_id: &str) -> Result<Option<String>, ConfigError> {
        if let Some(pem) = self
            .private_key_env
            .as_ref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
        {
            // Single-line env values commonly carry escaped newlines
            return Ok(Some(pem.replace("\\n", "\n")));
        }

        let Some(path) = env_first(self.private_key_path_env.as_ref(), self.private_key_path.as_ref())
        else {
            return Ok(None);
        };

        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| ConfigError::Secret {
                provider: provider_id.to_string(),
                field: "private_key_path".to_string(),
                reason: format!("{path}: {e}"),
            })
    }
}

fn env_first(env_var: Option<&String>, direct: Option<&String>) -> Option<String> {
    env_var
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
        .or_else(|| direct.cloned())
}

fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Initialize `env_logger` with the configured filter; repeated calls are ignored
pub fn init_logging(level: &str) {
    let result = env_logger::Builder::new()
        .parse_filters(level)
        .format_timestamp_millis()
        .try_init();
    if result.is_ok() {
        info!("Logging initialized at level '{level}'");
    }
}
