use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
}

/// Public view of a configured provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderSummary {
    pub id: String,
    pub display_name: String,
}

/// A pending login, created by `begin_login` and consumed exactly once by `complete_login`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationRequestState {
    pub state: String,
    pub provider_id: String,
    pub nonce: String,
    pub pkce_verifier: Option<String>,
    /// Validated post-login redirect target
    pub redirect_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationRequestState {
    /// The expiry instant itself counts as expired
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Tokens returned by a provider's token endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

impl fmt::Debug for ProviderTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderTokens")
            .field("access_token", &"[redacted]")
            .field("id_token", &self.id_token.as_ref().map(|_| "[redacted]"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[redacted]"),
            )
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Normalized identity asserted by a provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VerifiedIdentity {
    pub provider_id: String,
    pub subject: String,
    /// Only set when the provider asserts the address is verified
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub raw_claims: Value,
}

/// A first-party session as handed to the client
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub generation: u32,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .field("access_token", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("access_expires_at", &self.access_expires_at)
            .field("refresh_expires_at", &self.refresh_expires_at)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Authenticated caller, attached to requests by the session validator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Principal {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub provider_id: String,
    pub subject: String,
    pub email: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Apple sends the user's name and email only on first authorization, as a
/// JSON `user` form field on the callback
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AppleUserName {
    #[serde(rename = "firstName")]
    pub first_name: Option<String>,
    #[serde(rename = "lastName")]
    pub last_name: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct AppleUserInfo {
    #[serde(default)]
    pub name: AppleUserName,
    pub email: Option<String>,
}

impl AppleUserInfo {
    /// Parse the callback `user` field, which arrives either as a JSON string or an object
    #[must_use]
    pub fn from_callback_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(json_str) => serde_json::from_str(json_str).ok(),
            other => serde_json::from_value(other.clone()).ok(),
        }
    }

    #[must_use]
    pub fn full_name(&self) -> Option<String> {
        match (&self.name.first_name, &self.name.last_name) {
            (Some(first), Some(last)) => Some(format!("{first} {last}")),
            (Some(first), None) => Some(first.clone()),
            (None, Some(last)) => Some(last.clone()),
            (None, None) => None,
        }
    }
}
