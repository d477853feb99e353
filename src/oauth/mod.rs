//! Provider-facing OAuth plumbing
//!
//! - [`exchange`] - the authorization code flow (`begin_login` / `complete_login`)
//! - [`transport`] - outbound HTTP with retries for idempotent requests
//! - [`pkce`] - S256 code challenges
//! - [`client_secret`] - signed client assertions for Apple

pub mod client_secret;
pub mod exchange;
pub mod pkce;
pub mod transport;

pub use exchange::AuthorizationCodeExchanger;
pub use transport::{ProviderClient, ProviderTransport, ReqwestTransport};
