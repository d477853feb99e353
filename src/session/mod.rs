//! First-party sessions
//!
//! - [`issuer`] - issue, refresh (rotation with reuse detection) and revoke
//! - [`validator`] - access-token validation and the `RequireSession` middleware
//! - [`tokens`] - HS256 access tokens
//! - [`store`] - state, session and user storage traits with in-memory backends
//! - [`cookie`] - session cookies
//! - [`activity`] - sign-in counters and recent attempts

pub mod activity;
pub mod cookie;
pub mod issuer;
pub mod store;
pub mod tokens;
pub mod validator;

pub use activity::{AuthActivityLog, AuthActivitySnapshot};
pub use cookie::CookieFactory;
pub use issuer::SessionIssuer;
pub use store::{
    AuthStateStore, InMemoryAuthStateStore, InMemorySessionStore, InMemoryUserStore,
    SessionStore, UserStore,
};
pub use tokens::AccessTokenSigner;
pub use validator::{RequireSession, SessionValidator};
