//! Claim normalization
//!
//! Providers disagree on where identity attributes live (`sub` vs `id` vs
//! `data.id`, numeric vs string ids). Each adapter carries a [`ClaimMapping`]
//! of JSON pointers, so normalization is table driven.

use crate::error::VerificationError;
use crate::models::VerifiedIdentity;
use crate::registry::ClaimMapping;
use serde_json::Value;

/// Read a pointer as a non-empty string; numbers are rendered in decimal
fn string_at(claims: &Value, pointer: &str) -> Option<String> {
    match claims.pointer(pointer)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Read a pointer as a boolean, accepting Apple's `"true"` / `"false"` strings
fn bool_at(claims: &Value, pointer: &str) -> Option<bool> {
    match claims.pointer(pointer)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Build a [`VerifiedIdentity`] from raw claims
///
/// The email is kept only when the provider asserts it is verified.
///
/// # Errors
///
/// Returns `VerificationError::ClaimInvalid` if the subject is missing
pub fn normalize(
    provider_id: &str,
    mapping: &ClaimMapping,
    claims: Value,
) -> Result<VerifiedIdentity, VerificationError> {
    let subject = string_at(&claims, &mapping.subject)
        .ok_or_else(|| VerificationError::claim("sub", format!("missing at {}", mapping.subject)))?;

    let email_verified = mapping
        .email_verified
        .as_deref()
        .and_then(|pointer| bool_at(&claims, pointer))
        .unwrap_or(false);
    let email = mapping
        .email
        .as_deref()
        .and_then(|pointer| string_at(&claims, pointer))
        .filter(|_| email_verified);

    let name = mapping
        .name
        .iter()
        .find_map(|pointer| string_at(&claims, pointer));

    Ok(VerifiedIdentity {
        provider_id: provider_id.to_string(),
        subject,
        email,
        email_verified,
        name,
        raw_claims: claims,
    })
}
