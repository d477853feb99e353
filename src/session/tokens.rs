//! HS256 access tokens
//!
//! Access tokens are compact JWTs signed with the session secret. They carry
//! the first-party user id as `sub` and the session family id as `sid`, which
//! the validator uses for its revocation lookup.

use crate::error::SessionError;
use crate::settings::ttl_from_seconds;
use crate::utils::crypto::{
    create_jwt, create_jwt_header, decode_jwt_segment, split_jwt, verify_hmac_sha256,
    JwtAlgorithm,
};
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessTokenClaims {
    pub iss: String,
    pub aud: String,
    /// First-party user id
    pub sub: String,
    /// Session (refresh-token family) id
    pub sid: String,
    /// Provider id the session was established with
    pub idp: String,
    /// Subject at the provider
    pub idp_sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub gen: u32,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

impl AccessTokenClaims {
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.exp, 0)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// What a new access token is minted for
pub struct AccessTokenSubject<'a> {
    pub user_id: Uuid,
    pub session_id: Uuid,
    pub provider_id: &'a str,
    pub subject: &'a str,
    pub email: Option<&'a str>,
    pub generation: u32,
}

#[derive(Clone)]
pub struct AccessTokenSigner {
    secret: Vec<u8>,
    issuer: String,
    audience: String,
    ttl: Duration,
}

impl AccessTokenSigner {
    #[must_use]
    pub fn new(secret: &[u8], issuer: String, audience: String, ttl_seconds: u64) -> Self {
        Self {
            secret: secret.to_vec(),
            issuer,
            audience,
            ttl: ttl_from_seconds(ttl_seconds),
        }
    }

    /// Sign an access token valid from `now` for the configured TTL
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Signing` if serialization or signing fails
    pub fn sign(
        &self,
        subject: &AccessTokenSubject<'_>,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), SessionError> {
        let expires_at = now + self.ttl;
        let claims = AccessTokenClaims {
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            sub: subject.user_id.to_string(),
            sid: subject.session_id.to_string(),
            idp: subject.provider_id.to_string(),
            idp_sub: subject.subject.to_string(),
            email: subject.email.map(str::to_string),
            gen: subject.generation,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let payload =
            serde_json::to_value(&claims).map_err(|e| SessionError::Signing(e.to_string()))?;
        let token = create_jwt(
            &create_jwt_header(JwtAlgorithm::HS256, None),
            &payload,
            JwtAlgorithm::HS256,
            &self.secret,
        )
        .map_err(|e| SessionError::Signing(e.to_string()))?;

        // Expiry is carried in whole seconds
        let expires_at = claims.expires_at();
        Ok((token, expires_at))
    }

    /// Verify signature, issuer, audience and expiry
    ///
    /// # Errors
    ///
    /// - `SessionError::Expired` when `now >= exp`
    /// - `SessionError::Invalid` for any format, signature or claim problem
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<AccessTokenClaims, SessionError> {
        let (header_b64, payload_b64, signature_b64) =
            split_jwt(token).map_err(|e| SessionError::Invalid(e.to_string()))?;

        let header: serde_json::Value = decode_jwt_segment(header_b64)
            .map_err(|e| SessionError::Invalid(format!("header: {e}")))?;
        if header.get("alg").and_then(serde_json::Value::as_str) != Some("HS256") {
            return Err(SessionError::Invalid("unexpected algorithm".to_string()));
        }

        let signature = general_purpose::URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| SessionError::Invalid("signature encoding".to_string()))?;
        let message = format!("{header_b64}.{payload_b64}");
        if !verify_hmac_sha256(message.as_bytes(), &signature, &self.secret) {
            return Err(SessionError::Invalid("signature mismatch".to_string()));
        }

        let claims: AccessTokenClaims = decode_jwt_segment(payload_b64)
            .map_err(|e| SessionError::Invalid(format!("claims: {e}")))?;

        if claims.iss != self.issuer {
            return Err(SessionError::Invalid("issuer mismatch".to_string()));
        }
        if claims.aud != self.audience {
            return Err(SessionError::Invalid("audience mismatch".to_string()));
        }
        if now.timestamp() >= claims.exp {
            return Err(SessionError::Expired);
        }

        Ok(claims)
    }
}
