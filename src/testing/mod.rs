//! Testing utilities
//!
//! - [`fixtures`] - settings, a provider registry and ID-token claims
//! - [`keys`] - provider signing keys, JWKS documents and ID-token minting
//! - [`stub`] - a scripted [`ProviderTransport`](crate::oauth::transport::ProviderTransport)
//!
//! Available to unit tests, and to integration tests through the `testing` feature.

pub mod fixtures;
pub mod keys;
pub mod stub;

pub use stub::StubTransport;
