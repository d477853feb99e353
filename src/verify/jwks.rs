// JWKS caching and ID-token signature verification
// Supports RS256/RS384/RS512 and ES256

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use tokio::sync::RwLock;

use p256::ecdsa::{Signature as EcdsaSignature, VerifyingKey as EcdsaVerifyingKey};
use p256::EncodedPoint;
use rsa::{pkcs1v15::VerifyingKey as RsaVerifyingKey, RsaPublicKey};

use crate::error::VerificationError;
use crate::oauth::transport::{ProviderClient, ProviderRequest};

/// Algorithms accepted on provider ID tokens
pub const SUPPORTED_ALGORITHMS: &[&str] = &["RS256", "RS384", "RS512", "ES256"];

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonWebKeySet {
    pub keys: Vec<JsonWebKey>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JsonWebKey {
    pub kty: String,
    pub kid: Option<String>,
    pub alg: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,

    // RSA
    pub n: Option<String>,
    pub e: Option<String>,

    // EC
    pub crv: Option<String>,
    pub x: Option<String>,
    pub y: Option<String>,
}

struct ProviderKeys {
    keys: Vec<JsonWebKey>,
    fetched_at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheState {
    providers: HashMap<String, ProviderKeys>,
    failed_fetches: HashMap<String, DateTime<Utc>>,
}

/// Per-provider JWKS cache
///
/// Keys are refetched when the cache is older than `cache_duration` or when a
/// token names a `kid` the cache does not hold. Both a failed fetch and a
/// refetch for an unknown `kid` wait out `retry_backoff` since the last fetch.
#[derive(Clone)]
pub struct JwksCache {
    state: Arc<RwLock<CacheState>>,
    client: ProviderClient,
    cache_duration: Duration,
    retry_backoff: Duration,
}

impl JwksCache {
    #[must_use]
    pub fn new(client: ProviderClient, cache_duration: Duration, retry_backoff: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(CacheState::default())),
            client,
            cache_duration,
            retry_backoff,
        }
    }

    /// Find the key for `kid` (or the only signing key when the token has no `kid`)
    ///
    /// # Errors
    ///
    /// Returns `VerificationError::KeyUnavailable` if the JWKS cannot be fetched
    /// or holds no matching key
    pub async fn get_key(
        &self,
        provider: &str,
        jwks_uri: &str,
        kid: Option<&str>,
    ) -> Result<JsonWebKey, VerificationError> {
        {
            let state = self.state.read().await;
            if let Some(cached) = state.providers.get(provider) {
                if self.is_fresh(cached.fetched_at) {
                    if let Some(key) = select_key(&cached.keys, kid) {
                        debug!("🎯 Found cached key {kid:?} for provider '{provider}'");
                        return Ok(key.clone());
                    }
                    if !self.backoff_elapsed(cached.fetched_at) {
                        debug!("Unknown kid {kid:?} for provider '{provider}', JWKS fetched recently");
                        return Err(missing_key(provider, kid));
                    }
                }
            }
        }

        self.refresh(provider, jwks_uri).await?;

        let state = self.state.read().await;
        state
            .providers
            .get(provider)
            .and_then(|cached| select_key(&cached.keys, kid))
            .cloned()
            .ok_or_else(|| missing_key(provider, kid))
    }

    async fn refresh(&self, provider: &str, jwks_uri: &str) -> Result<(), VerificationError> {
        {
            let state = self.state.read().await;
            if let Some(failed_at) = state.failed_fetches.get(provider) {
                if !self.backoff_elapsed(*failed_at) {
                    return Err(VerificationError::KeyUnavailable(
                        "JWKS fetch skipped during backoff after a recent failure".to_string(),
                    ));
                }
            }
        }

        debug!("🔑 Fetching JWKS for provider '{provider}' from {jwks_uri}");
        let fetched = self
            .client
            .get_json(ProviderRequest::get(jwks_uri))
            .await
            .map_err(|e| e.to_string())
            .and_then(|value| {
                serde_json::from_value::<JsonWebKeySet>(value)
                    .map_err(|e| format!("invalid JWKS document: {e}"))
            });

        let mut state = self.state.write().await;
        match fetched {
            Ok(jwks) => {
                debug!("💾 Cached {} keys for provider '{provider}'", jwks.keys.len());
                state.providers.insert(
                    provider.to_string(),
                    ProviderKeys {
                        keys: jwks.keys,
                        fetched_at: Utc::now(),
                    },
                );
                state.failed_fetches.remove(provider);
                Ok(())
            }
            Err(reason) => {
                warn!("JWKS fetch for provider '{provider}' failed: {reason}");
                state.failed_fetches.insert(provider.to_string(), Utc::now());
                Err(VerificationError::KeyUnavailable(reason))
            }
        }
    }

    fn is_fresh(&self, fetched_at: DateTime<Utc>) -> bool {
        let elapsed = Utc::now().signed_duration_since(fetched_at);
        elapsed.to_std().unwrap_or(Duration::ZERO) < self.cache_duration
    }

    fn backoff_elapsed(&self, failed_at: DateTime<Utc>) -> bool {
        let elapsed = Utc::now().signed_duration_since(failed_at);
        elapsed.to_std().unwrap_or(Duration::ZERO) >= self.retry_backoff
    }
}

fn missing_key(provider: &str, kid: Option<&str>) -> VerificationError {
    VerificationError::KeyUnavailable(format!("no key with kid {kid:?} for provider '{provider}'"))
}

fn select_key<'a>(keys: &'a [JsonWebKey], kid: Option<&str>) -> Option<&'a JsonWebKey> {
    let mut signing_keys = keys
        .iter()
        .filter(|k| k.key_use.as_deref().is_none_or(|u| u == "sig"));
    match kid {
        Some(kid) => signing_keys.find(|k| k.kid.as_deref() == Some(kid)),
        None => {
            let first = signing_keys.next();
            // Without a kid only an unambiguous key set is usable
            if signing_keys.next().is_some() {
                None
            } else {
                first
            }
        }
    }
}

/// Verify a compact JWS signature with a JWK
///
/// # Errors
///
/// Returns `VerificationError::SignatureInvalid` for unsupported algorithms,
/// unusable keys and signature mismatches
pub fn verify_signature(
    signing_input: &str,
    signature: &[u8],
    algorithm: &str,
    key: &JsonWebKey,
) -> Result<(), VerificationError> {
    if let Some(key_alg) = &key.alg {
        if key_alg != algorithm {
            return Err(VerificationError::SignatureInvalid(format!(
                "token algorithm {algorithm} does not match key algorithm {key_alg}"
            )));
        }
    }

    match algorithm {
        "RS256" | "RS384" | "RS512" => verify_rsa(signing_input, signature, algorithm, key),
        "ES256" => verify_es256(signing_input, signature, key),
        alg => Err(VerificationError::SignatureInvalid(format!(
            "unsupported algorithm {alg}"
        ))),
    }
}

fn decode_component(value: Option<&String>, name: &str) -> Result<Vec<u8>, VerificationError> {
    let value = value
        .ok_or_else(|| VerificationError::SignatureInvalid(format!("JWK is missing '{name}'")))?;
    general_purpose::URL_SAFE_NO_PAD
        .decode(value)
        .map_err(|e| VerificationError::SignatureInvalid(format!("JWK '{name}' encoding: {e}")))
}

fn verify_rsa(
    signing_input: &str,
    signature: &[u8],
    algorithm: &str,
    key: &JsonWebKey,
) -> Result<(), VerificationError> {
    use rsa::signature::Verifier;

    if key.kty != "RSA" {
        return Err(VerificationError::SignatureInvalid(format!(
            "expected an RSA key, got {}",
            key.kty
        )));
    }
    let n = decode_component(key.n.as_ref(), "n")?;
    let e = decode_component(key.e.as_ref(), "e")?;

    let public_key = RsaPublicKey::new(
        rsa::BigUint::from_bytes_be(&n),
        rsa::BigUint::from_bytes_be(&e),
    )
    .map_err(|e| VerificationError::SignatureInvalid(format!("invalid RSA key: {e}")))?;
    let signature = rsa::pkcs1v15::Signature::try_from(signature)
        .map_err(|e| VerificationError::SignatureInvalid(format!("invalid signature: {e}")))?;

    let message = signing_input.as_bytes();
    let verified = match algorithm {
        "RS256" => RsaVerifyingKey::<Sha256>::new(public_key).verify(message, &signature),
        "RS384" => RsaVerifyingKey::<Sha384>::new(public_key).verify(message, &signature),
        _ => RsaVerifyingKey::<Sha512>::new(public_key).verify(message, &signature),
    };
    verified.map_err(|_| VerificationError::SignatureInvalid("signature mismatch".to_string()))
}

fn verify_es256(signing_input: &str, signature: &[u8], key: &JsonWebKey) -> Result<(), VerificationError> {
    use p256::ecdsa::signature::Verifier;

    if key.kty != "EC" || key.crv.as_deref().is_some_and(|crv| crv != "P-256") {
        return Err(VerificationError::SignatureInvalid(
            "expected a P-256 EC key".to_string(),
        ));
    }
    let x = decode_component(key.x.as_ref(), "x")?;
    let y = decode_component(key.y.as_ref(), "y")?;

    // Uncompressed SEC1 point: 0x04 || x || y
    let mut point_bytes = Vec::with_capacity(1 + x.len() + y.len());
    point_bytes.push(0x04);
    point_bytes.extend_from_slice(&x);
    point_bytes.extend_from_slice(&y);

    let point = EncodedPoint::from_bytes(&point_bytes)
        .map_err(|e| VerificationError::SignatureInvalid(format!("invalid EC point: {e}")))?;
    let verifying_key = EcdsaVerifyingKey::from_encoded_point(&point)
        .map_err(|e| VerificationError::SignatureInvalid(format!("invalid EC key: {e}")))?;

    // JWS carries the fixed-size r || s form, not DER
    let signature = EcdsaSignature::from_slice(signature)
        .map_err(|e| VerificationError::SignatureInvalid(format!("invalid signature: {e}")))?;

    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| VerificationError::SignatureInvalid("signature mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::HttpSettings;
    use crate::testing::keys;
    use crate::testing::stub::StubTransport;
    use crate::utils::crypto::split_jwt;
    use serde_json::json;

    const JWKS_URI: &str = "https://idp.test/jwks";

    fn cache(transport: Arc<StubTransport>, retry_backoff: Duration) -> JwksCache {
        let http = HttpSettings {
            idempotent_retries: 0,
            ..HttpSettings::default()
        };
        JwksCache::new(
            ProviderClient::new(transport, &http),
            Duration::from_secs(3600),
            retry_backoff,
        )
    }

    fn parts(token: &str) -> (String, Vec<u8>) {
        let (h, p, s) = split_jwt(token).unwrap();
        (
            format!("{h}.{p}"),
            general_purpose::URL_SAFE_NO_PAD.decode(s).unwrap(),
        )
    }

    fn jwk(value: serde_json::Value) -> JsonWebKey {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_es256_signature() {
        let token = keys::mint_id_token(&json!({"sub": "1"}));
        let (input, signature) = parts(&token);
        let key = jwk(keys::ec_jwk(keys::TEST_EC_KEY_PEM, keys::TEST_EC_KID));

        assert!(verify_signature(&input, &signature, "ES256", &key).is_ok());

        let foreign = jwk(keys::ec_jwk(keys::FOREIGN_EC_KEY_PEM, keys::TEST_EC_KID));
        assert!(matches!(
            verify_signature(&input, &signature, "ES256", &foreign),
            Err(VerificationError::SignatureInvalid(_))
        ));
    }

    #[test]
    fn test_rs256_signature() {
        let token = keys::mint_rs256_id_token(&json!({"sub": "1"}));
        let (input, signature) = parts(&token);
        let key = jwk(keys::rsa_jwk(keys::TEST_RSA_KEY_PEM, keys::TEST_RSA_KID));

        assert!(verify_signature(&input, &signature, "RS256", &key).is_ok());
        assert!(verify_signature(&format!("{input}x"), &signature, "RS256", &key).is_err());
    }

    #[test]
    fn test_unsupported_and_mismatched_algorithms() {
        let key = jwk(keys::ec_jwk(keys::TEST_EC_KEY_PEM, keys::TEST_EC_KID));
        assert!(matches!(
            verify_signature("a.b", b"sig", "none", &key),
            Err(VerificationError::SignatureInvalid(_))
        ));
        assert!(matches!(
            verify_signature("a.b", b"sig", "RS256", &key),
            Err(VerificationError::SignatureInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_cache_refetches_on_unknown_kid() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(JWKS_URI, 200, &json!({"keys": []}).to_string());
        let cache = cache(transport.clone(), Duration::ZERO);

        assert!(cache
            .get_key("test", JWKS_URI, Some(keys::TEST_EC_KID))
            .await
            .is_err());

        transport.respond(JWKS_URI, 200, &keys::test_jwks().to_string());
        let key = cache
            .get_key("test", JWKS_URI, Some(keys::TEST_EC_KID))
            .await
            .unwrap();
        assert_eq!(key.kty, "EC");

        // Served from cache
        cache
            .get_key("test", JWKS_URI, Some(keys::TEST_EC_KID))
            .await
            .unwrap();
        assert_eq!(transport.request_count(JWKS_URI), 2);
    }

    #[tokio::test]
    async fn test_unknown_kids_do_not_refetch_within_backoff() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(JWKS_URI, 200, &keys::test_jwks().to_string());
        let cache = cache(transport.clone(), Duration::from_secs(300));

        for i in 0..50 {
            let kid = format!("rotated-{i}");
            let result = cache.get_key("test", JWKS_URI, Some(kid.as_str())).await;
            assert!(matches!(result, Err(VerificationError::KeyUnavailable(_))));
        }
        assert_eq!(transport.request_count(JWKS_URI), 1);

        // Known keys keep working from the cache
        assert!(cache
            .get_key("test", JWKS_URI, Some(keys::TEST_EC_KID))
            .await
            .is_ok());
        assert_eq!(transport.request_count(JWKS_URI), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_backs_off() {
        let transport = Arc::new(StubTransport::new());
        transport.respond(JWKS_URI, 500, "");
        let cache = cache(transport.clone(), Duration::from_secs(300));

        let first = cache.get_key("test", JWKS_URI, Some("k")).await;
        let second = cache.get_key("test", JWKS_URI, Some("k")).await;

        assert!(matches!(first, Err(VerificationError::KeyUnavailable(_))));
        assert!(matches!(second, Err(VerificationError::KeyUnavailable(_))));
        assert_eq!(transport.request_count(JWKS_URI), 1);
    }

    #[test]
    fn test_select_key_without_kid() {
        let one = vec![jwk(keys::ec_jwk(keys::TEST_EC_KEY_PEM, "a"))];
        assert!(select_key(&one, None).is_some());

        let two = vec![
            jwk(keys::ec_jwk(keys::TEST_EC_KEY_PEM, "a")),
            jwk(keys::ec_jwk(keys::FOREIGN_EC_KEY_PEM, "b")),
        ];
        assert!(select_key(&two, None).is_none());
        assert_eq!(select_key(&two, Some("b")).unwrap().kid.as_deref(), Some("b"));
    }
}
