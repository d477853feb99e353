//! Error taxonomy for the sign-in broker
//!
//! Errors are grouped by the stage that produces them:
//!
//! - [`ConfigError`] - bad or missing provider configuration, fatal at startup
//! - [`FlowError`] - authorization flow failures (state, code exchange)
//! - [`VerificationError`] - identity verification failures (ID token, userinfo)
//! - [`SessionError`] - first-party session failures (missing, expired, reused, ...)
//!
//! [`BrokerError`] wraps all of them and implements `ResponseError`, so handlers can
//! use `?` and still return generic, leak-free bodies to end users.

use crate::utils::responses::ResponseBuilder;
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use uuid::Uuid;

/// Configuration errors detected while building the provider registry or loading settings
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Provider '{0}' is registered more than once")]
    DuplicateProvider(String),

    #[error("Unknown provider '{0}'")]
    UnknownProvider(String),

    #[error("Provider '{provider}' is missing required setting '{field}'")]
    MissingField { provider: String, field: String },

    #[error("Provider '{provider}' has an invalid URL for '{field}': {reason}")]
    InvalidUrl {
        provider: String,
        field: String,
        reason: String,
    },

    #[error("Provider '{provider}' declares '{field}' inline; load it from an environment variable or file")]
    InlineSecret { provider: String, field: String },

    #[error("Failed to load secret '{field}' for provider '{provider}': {reason}")]
    Secret {
        provider: String,
        field: String,
        reason: String,
    },

    #[error("Unsupported provider adapter '{0}'")]
    UnsupportedAdapter(String),

    #[error("OIDC discovery failed for provider '{provider}': {reason}")]
    Discovery { provider: String, reason: String },

    #[error("No sign-in providers are configured")]
    NoProviders,

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),

    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse settings: {0}")]
    Parse(String),

    #[error("Invalid setting '{field}': {reason}")]
    InvalidSetting { field: String, reason: String },
}

/// Failure of a state, session or user store backend
#[derive(Debug, thiserror::Error)]
#[error("storage failure: {0}")]
pub struct StoreError(pub String);

/// Errors raised while running the authorization code flow
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Authorization state does not match a live login attempt")]
    StateMismatch,

    #[error("Authorization state has expired")]
    StateExpired,

    #[error("Token exchange with provider '{provider}' failed: {reason}")]
    ProviderExchange { provider: String, reason: String },

    #[error("Provider '{provider}' returned an authorization error: {error}")]
    ProviderDenied { provider: String, error: String },

    #[error("Callback is missing the '{0}' parameter")]
    MissingParameter(&'static str),

    #[error("Failed to build client credentials: {0}")]
    ClientAssertion(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while verifying the identity returned by a provider
#[derive(Debug, thiserror::Error)]
pub enum VerificationError {
    #[error("ID token signature verification failed: {0}")]
    SignatureInvalid(String),

    #[error("Claim '{claim}' is invalid: {reason}")]
    ClaimInvalid { claim: String, reason: String },

    #[error("Userinfo request failed: {0}")]
    UserinfoFetch(String),

    #[error("No signing key available: {0}")]
    KeyUnavailable(String),
}

impl VerificationError {
    pub(crate) fn claim(claim: &str, reason: impl Into<String>) -> Self {
        Self::ClaimInvalid {
            claim: claim.to_string(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by session issuance, rotation and validation
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("No session token was presented")]
    Missing,

    #[error("Session token has expired")]
    Expired,

    #[error("Session token is invalid: {0}")]
    Invalid(String),

    #[error("Session has been revoked")]
    Revoked,

    #[error("Refresh token is not recognized")]
    RefreshTokenInvalid,

    #[error("Refresh token reuse detected for session {session_id} (generation {generation})")]
    RefreshTokenReused { session_id: Uuid, generation: u32 },

    #[error("Unknown session {0}")]
    UnknownSession(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to sign session token: {0}")]
    Signing(String),
}

/// Top-level broker error used by handlers
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

impl BrokerError {
    /// Short, stable error code safe to show to end users
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(ConfigError::UnknownProvider(_)) => "unsupported_provider",
            Self::Config(_) => "configuration_error",
            Self::Flow(FlowError::StateMismatch | FlowError::MissingParameter(_)) => {
                "oauth_state_error"
            }
            Self::Flow(FlowError::StateExpired) => "oauth_state_expired",
            Self::Flow(FlowError::ProviderDenied { .. }) => "access_denied",
            Self::Flow(FlowError::Store(_)) => "server_error",
            Self::Flow(_) => "auth_failed",
            Self::Verification(_) => "identity_verification_failed",
            Self::Session(e) => e.code(),
        }
    }
}

impl SessionError {
    /// Short, stable error code safe to show to end users
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Missing => "session_missing",
            Self::Expired => "try_refresh_token",
            Self::Invalid(_) | Self::RefreshTokenInvalid | Self::UnknownSession(_) => {
                "session_invalid"
            }
            Self::Revoked => "session_revoked",
            Self::RefreshTokenReused { .. } => "token_theft_detected",
            Self::Store(_) | Self::Signing(_) => "server_error",
        }
    }
}

impl ResponseError for SessionError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Store(_) | Self::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::UNAUTHORIZED,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self.status_code() {
            StatusCode::UNAUTHORIZED => ResponseBuilder::unauthorized()
                .with_error_code(self.code())
                .build(),
            _ => ResponseBuilder::internal_server_error().build(),
        }
    }
}

impl ResponseError for BrokerError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Session(e) => e.status_code(),
            Self::Config(ConfigError::UnknownProvider(_)) => StatusCode::NOT_FOUND,
            Self::Config(_) | Self::Flow(FlowError::Store(_)) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Flow(_) | Self::Verification(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            Self::Session(e) => e.error_response(),
            Self::Config(ConfigError::UnknownProvider(_)) => ResponseBuilder::not_found()
                .with_error_code(self.code())
                .build(),
            Self::Config(_) | Self::Flow(FlowError::Store(_)) => {
                ResponseBuilder::internal_server_error().build()
            }
            Self::Flow(_) | Self::Verification(_) => ResponseBuilder::bad_request()
                .with_error_code(self.code())
                .build(),
        }
    }
}
