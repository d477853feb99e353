#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![deny(warnings)]
#![allow(clippy::multiple_crate_versions)]

/// Version of the sign-in broker
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod broker;
pub mod error;
pub mod handlers;
pub mod models;
pub mod oauth;
pub mod registry;
pub mod session;
pub mod settings;
pub mod utils;
pub mod verify;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// Re-export commonly used items
pub use broker::Broker;
pub use error::{BrokerError, ConfigError, FlowError, SessionError, VerificationError};
pub use handlers::configure_services;
pub use models::{Principal, Session, VerifiedIdentity};
pub use registry::ProviderRegistry;
pub use settings::BrokerSettings;
