//! PKCE (RFC 7636) with the S256 method

use crate::utils::crypto::generate_random_token;
use base64::{engine::general_purpose, Engine as _};
use sha2::{Digest, Sha256};

/// 32 random bytes give a 43 character verifier, the RFC minimum length
const VERIFIER_BYTES: usize = 32;

pub const CHALLENGE_METHOD: &str = "S256";

#[must_use]
pub fn generate_verifier() -> String {
    generate_random_token(VERIFIER_BYTES)
}

/// `BASE64URL(SHA256(verifier))`
#[must_use]
pub fn challenge_for(verifier: &str) -> String {
    general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc7636_appendix_b_vector() {
        assert_eq!(
            challenge_for("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn test_verifier_shape() {
        let verifier = generate_verifier();
        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }
}
