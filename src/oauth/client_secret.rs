//! Signed client assertions
//!
//! Apple does not issue static client secrets. Each token request carries a
//! short-lived ES256 JWT signed with the developer's private key instead.

use crate::error::FlowError;
use crate::utils::crypto::{create_jwt, create_jwt_header, JwtAlgorithm};
use chrono::{Duration, Utc};

pub const APPLE_AUDIENCE: &str = "https://appleid.apple.com";

/// Lifetime of a generated client assertion
const ASSERTION_TTL_MINUTES: i64 = 5;

/// Check at startup that a configured private key is a usable P-256 PKCS#8 key
///
/// # Errors
///
/// Returns a description of the parse failure
pub fn check_signing_key(private_key_pem: &str) -> Result<(), String> {
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::DecodePrivateKey;

    SigningKey::from_pkcs8_pem(private_key_pem)
        .map(|_| ())
        .map_err(|e| format!("not a P-256 PKCS#8 private key: {e}"))
}

/// Generate the ES256 client secret JWT for Apple's token endpoint
///
/// Claims: `iss` = team id, `sub` = client id, `aud` = Apple, `iat`/`exp`
/// five minutes apart. The header carries the key id.
///
/// # Errors
///
/// Returns `FlowError::ClientAssertion` if the key cannot be parsed or signing fails
pub fn generate_client_assertion(
    team_id: &str,
    key_id: &str,
    client_id: &str,
    private_key_pem: &str,
) -> Result<String, FlowError> {
    let header = create_jwt_header(JwtAlgorithm::ES256, Some(key_id));

    let now = Utc::now();
    let exp = now + Duration::minutes(ASSERTION_TTL_MINUTES);

    let payload = serde_json::json!({
        "iss": team_id,
        "iat": now.timestamp(),
        "exp": exp.timestamp(),
        "aud": APPLE_AUDIENCE,
        "sub": client_id
    });

    let jwt = create_jwt(
        &header,
        &payload,
        JwtAlgorithm::ES256,
        private_key_pem.as_bytes(),
    )
    .map_err(|e| FlowError::ClientAssertion(e.to_string()))?;

    log::debug!("Generated client assertion for {client_id} (kid {key_id})");
    Ok(jwt)
}
