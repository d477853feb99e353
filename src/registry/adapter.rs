//! Built-in provider adapters and their defaults

use super::{ClaimMapping, ClientAuthMethod};
use crate::error::ConfigError;
use std::fmt;

/// How a provider proves the user's identity and which quirks apply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderAdapter {
    Google,
    Apple,
    GitHub,
    Twitter,
    /// Any OpenID Connect provider, usually configured through discovery
    Oidc,
    /// Plain OAuth 2.0 with a userinfo endpoint
    OAuth2,
}

/// Endpoint and behaviour defaults for an adapter
pub struct AdapterDefaults {
    pub display_name: Option<&'static str>,
    pub authorization_endpoint: Option<&'static str>,
    pub token_endpoint: Option<&'static str>,
    pub userinfo_endpoint: Option<&'static str>,
    pub jwks_uri: Option<&'static str>,
    pub issuer: Option<&'static str>,
    pub scopes: &'static [&'static str],
    pub client_auth: ClientAuthMethod,
    pub use_pkce: bool,
    pub extra_auth_params: &'static [(&'static str, &'static str)],
}

impl ProviderAdapter {
    /// Parse an adapter name from settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedAdapter` for unknown names
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "apple" => Ok(Self::Apple),
            "github" => Ok(Self::GitHub),
            "twitter" | "x" => Ok(Self::Twitter),
            "oidc" => Ok(Self::Oidc),
            "oauth2" => Ok(Self::OAuth2),
            other => Err(ConfigError::UnsupportedAdapter(other.to_string())),
        }
    }

    /// Pick an adapter for a provider with no explicit `adapter` setting
    #[must_use]
    pub fn infer(provider_id: &str, has_discovery: bool) -> Self {
        match Self::parse(provider_id) {
            Ok(adapter) => adapter,
            Err(_) if has_discovery => Self::Oidc,
            Err(_) => Self::OAuth2,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::Apple => "apple",
            Self::GitHub => "github",
            Self::Twitter => "twitter",
            Self::Oidc => "oidc",
            Self::OAuth2 => "oauth2",
        }
    }

    /// Whether identity comes from a signed ID token (otherwise from userinfo)
    #[must_use]
    pub fn is_oidc(self) -> bool {
        matches!(self, Self::Google | Self::Apple | Self::Oidc)
    }

    #[must_use]
    pub fn defaults(self) -> AdapterDefaults {
        match self {
            Self::Google => AdapterDefaults {
                display_name: Some("Google"),
                authorization_endpoint: Some("https://accounts.google.com/o/oauth2/v2/auth"),
                token_endpoint: Some("https://oauth2.googleapis.com/token"),
                userinfo_endpoint: Some("https://openidconnect.googleapis.com/v1/userinfo"),
                jwks_uri: Some("https://www.googleapis.com/oauth2/v3/certs"),
                issuer: Some("https://accounts.google.com"),
                scopes: &["openid", "email", "profile"],
                client_auth: ClientAuthMethod::Post,
                use_pkce: true,
                extra_auth_params: &[],
            },
            Self::Apple => AdapterDefaults {
                display_name: Some("Apple"),
                authorization_endpoint: Some("https://appleid.apple.com/auth/authorize"),
                token_endpoint: Some("https://appleid.apple.com/auth/token"),
                userinfo_endpoint: None,
                jwks_uri: Some("https://appleid.apple.com/auth/keys"),
                issuer: Some("https://appleid.apple.com"),
                scopes: &["openid", "name", "email"],
                client_auth: ClientAuthMethod::Post,
                use_pkce: false,
                // Apple only returns the user's name when the callback is a form POST
                extra_auth_params: &[("response_mode", "form_post")],
            },
            Self::GitHub => AdapterDefaults {
                display_name: Some("GitHub"),
                authorization_endpoint: Some("https://github.com/login/oauth/authorize"),
                token_endpoint: Some("https://github.com/login/oauth/access_token"),
                userinfo_endpoint: Some("https://api.github.com/user"),
                jwks_uri: None,
                issuer: None,
                scopes: &["read:user", "user:email"],
                client_auth: ClientAuthMethod::Post,
                use_pkce: false,
                extra_auth_params: &[],
            },
            Self::Twitter => AdapterDefaults {
                display_name: Some("Twitter"),
                authorization_endpoint: Some("https://twitter.com/i/oauth2/authorize"),
                token_endpoint: Some("https://api.twitter.com/2/oauth2/token"),
                userinfo_endpoint: Some("https://api.twitter.com/2/users/me"),
                jwks_uri: None,
                issuer: None,
                scopes: &["users.read", "tweet.read"],
                client_auth: ClientAuthMethod::Basic,
                use_pkce: true,
                extra_auth_params: &[],
            },
            Self::Oidc => AdapterDefaults {
                display_name: None,
                authorization_endpoint: None,
                token_endpoint: None,
                userinfo_endpoint: None,
                jwks_uri: None,
                issuer: None,
                scopes: &["openid", "email", "profile"],
                client_auth: ClientAuthMethod::Post,
                use_pkce: true,
                extra_auth_params: &[],
            },
            Self::OAuth2 => AdapterDefaults {
                display_name: None,
                authorization_endpoint: None,
                token_endpoint: None,
                userinfo_endpoint: None,
                jwks_uri: None,
                issuer: None,
                scopes: &[],
                client_auth: ClientAuthMethod::Post,
                use_pkce: true,
                extra_auth_params: &[],
            },
        }
    }

    /// Default JSON-pointer claim mapping for the adapter
    #[must_use]
    pub fn default_claims(self) -> ClaimMapping {
        match self {
            Self::Google | Self::Apple | Self::Oidc | Self::OAuth2 => ClaimMapping {
                subject: "/sub".to_string(),
                email: Some("/email".to_string()),
                email_verified: Some("/email_verified".to_string()),
                name: vec!["/name".to_string()],
            },
            // Public profile email is not a verification signal; the verifier
            // reads the primary verified address from /user/emails instead
            Self::GitHub => ClaimMapping {
                subject: "/id".to_string(),
                email: None,
                email_verified: None,
                name: vec!["/name".to_string(), "/login".to_string()],
            },
            // Twitter does not expose email addresses through /2/users/me
            Self::Twitter => ClaimMapping {
                subject: "/data/id".to_string(),
                email: None,
                email_verified: None,
                name: vec!["/data/name".to_string(), "/data/username".to_string()],
            },
        }
    }

    /// Whether the token endpoint needs an explicit `Accept: application/json`
    #[must_use]
    pub fn wants_json_accept(self) -> bool {
        matches!(self, Self::GitHub)
    }
}

impl fmt::Display for ProviderAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_infer() {
        assert_eq!(ProviderAdapter::parse("GitHub").unwrap(), ProviderAdapter::GitHub);
        assert!(matches!(
            ProviderAdapter::parse("myspace"),
            Err(ConfigError::UnsupportedAdapter(_))
        ));
        assert_eq!(ProviderAdapter::infer("apple", false), ProviderAdapter::Apple);
        assert_eq!(ProviderAdapter::infer("corp-sso", true), ProviderAdapter::Oidc);
        assert_eq!(ProviderAdapter::infer("legacy", false), ProviderAdapter::OAuth2);
    }

    #[test]
    fn test_oidc_adapters_have_keys_and_issuer() {
        for adapter in [ProviderAdapter::Google, ProviderAdapter::Apple] {
            let defaults = adapter.defaults();
            assert!(adapter.is_oidc());
            assert!(defaults.jwks_uri.is_some());
            assert!(defaults.issuer.is_some());
        }
        assert!(!ProviderAdapter::GitHub.is_oidc());
        assert!(!ProviderAdapter::Twitter.is_oidc());
    }

    #[test]
    fn test_twitter_requires_pkce_and_basic_auth() {
        let defaults = ProviderAdapter::Twitter.defaults();
        assert!(defaults.use_pkce);
        assert_eq!(defaults.client_auth, ClientAuthMethod::Basic);
        assert_eq!(ProviderAdapter::Twitter.default_claims().subject, "/data/id");
    }

    #[test]
    fn test_apple_uses_form_post() {
        let defaults = ProviderAdapter::Apple.defaults();
        assert!(defaults
            .extra_auth_params
            .contains(&("response_mode", "form_post")));
    }
}
