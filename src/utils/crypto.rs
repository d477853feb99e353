// Cryptographic utilities for generating secure tokens and signing JWTs

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Bytes of entropy in an authorization `state` value (192 bits)
pub const STATE_BYTES: usize = 24;

/// Bytes of entropy in an opaque refresh token (256 bits)
pub const REFRESH_TOKEN_BYTES: usize = 32;

/// Generate a cryptographically secure authorization `state` value
///
/// 24 bytes (192 bits) of entropy, base64url encoded to 32 characters so it
/// stays short in provider redirect URLs.
#[must_use]
pub fn generate_state() -> String {
    generate_random_token(STATE_BYTES)
}

/// Generate `length` bytes of secure random data, base64url encoded without padding
#[must_use]
pub fn generate_random_token(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// Hash a bearer secret for storage
///
/// Refresh tokens are only ever stored as this digest; the raw value lives
/// with the client.
#[must_use]
pub fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

/// Split a compact JWS into its three segments
///
/// # Errors
///
/// Returns an error if the token does not have exactly three non-empty segments
pub fn split_jwt(token: &str) -> Result<(&str, &str, &str)> {
    let mut parts = token.split('.');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty() => {
            Ok((h, p, s))
        }
        _ => Err(anyhow!("Invalid JWT format: expected 3 segments")),
    }
}

/// Decode a base64url JWT segment into a JSON type
///
/// # Errors
///
/// Returns an error if base64 decoding or JSON parsing fails
pub fn decode_jwt_segment<T: DeserializeOwned>(segment: &str) -> Result<T> {
    let bytes = general_purpose::URL_SAFE_NO_PAD
        .decode(segment)
        .context("Base64 decode failed")?;
    serde_json::from_slice(&bytes).context("JSON parse failed")
}

/// JWT signing algorithms supported by [`create_jwt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JwtAlgorithm {
    /// HMAC with SHA-256 (symmetric key)
    HS256,
    /// ECDSA with P-256 curve and SHA-256 (asymmetric key)
    ES256,
}

impl JwtAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HS256 => "HS256",
            Self::ES256 => "ES256",
        }
    }
}

/// Create a signed compact JWT
///
/// `key_material` is the shared secret for HS256, or a PEM-encoded PKCS#8
/// private key for ES256.
///
/// # Errors
///
/// Returns an error if:
/// - JSON serialization fails
/// - Key parsing fails (for ES256)
/// - Signing fails
pub fn create_jwt(
    header: &serde_json::Value,
    payload: &serde_json::Value,
    algorithm: JwtAlgorithm,
    key_material: &[u8],
) -> Result<String> {
    let header_json = serde_json::to_string(header).context("Failed to serialize JWT header")?;
    let payload_json =
        serde_json::to_string(payload).context("Failed to serialize JWT payload")?;

    let header_b64 = general_purpose::URL_SAFE_NO_PAD.encode(header_json.as_bytes());
    let payload_b64 = general_purpose::URL_SAFE_NO_PAD.encode(payload_json.as_bytes());

    let message = format!("{header_b64}.{payload_b64}");

    let signature_bytes = match algorithm {
        JwtAlgorithm::HS256 => sign_hmac_sha256(message.as_bytes(), key_material)?,
        JwtAlgorithm::ES256 => {
            let key_pem = std::str::from_utf8(key_material)
                .context("ES256 key material must be valid UTF-8 PEM")?;
            sign_es256(message.as_bytes(), key_pem)?
        }
    };

    let signature_b64 = general_purpose::URL_SAFE_NO_PAD.encode(&signature_bytes);

    Ok(format!("{message}.{signature_b64}"))
}

/// Verify an HS256 signature over `message` in constant time
#[must_use]
pub fn verify_hmac_sha256(message: &[u8], signature: &[u8], secret: &[u8]) -> bool {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(secret) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(signature).is_ok()
}

fn sign_hmac_sha256(message: &[u8], secret: &[u8]) -> Result<Vec<u8>> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(secret).context("Invalid HMAC key length")?;
    mac.update(message);

    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sign with ECDSA P-256 / SHA-256, returning the fixed-size `r || s` form JWS expects
fn sign_es256(message: &[u8], private_key_pem: &str) -> Result<Vec<u8>> {
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};
    use p256::pkcs8::DecodePrivateKey;

    let signing_key = SigningKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| anyhow!("Failed to parse ECDSA private key: {e:?}"))?;

    let signature: Signature = signing_key.sign(message);
    Ok(signature.to_bytes().to_vec())
}

/// Create a JWT header for the given algorithm, with an optional key id
#[must_use]
pub fn create_jwt_header(algorithm: JwtAlgorithm, key_id: Option<&str>) -> serde_json::Value {
    let mut header = serde_json::json!({
        "alg": algorithm.as_str(),
        "typ": "JWT"
    });

    if let Some(kid) = key_id {
        header["kid"] = serde_json::Value::String(kid.to_string());
    }

    header
}
