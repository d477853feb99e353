// HTTP handlers for the sign-in broker
pub mod oauth;
pub mod session;
pub mod system;

use crate::broker::Broker;
use crate::session::RequireSession;
use actix_web::web;

pub use oauth::{authorize, callback};
pub use session::{refresh, revoke, session_info};
pub use system::{ping, providers};

/// Response and request header carrying the access token
pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";
/// Response and request header carrying the refresh token
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

/// Register the broker's routes
///
/// Everything except `/ping` lives under `application.api_base_path`.
pub fn configure_services(cfg: &mut web::ServiceConfig, broker: &Broker) {
    let base_path = broker.settings.application.api_base_path();

    cfg.route("/ping", web::get().to(ping)).service(
        web::scope(&base_path)
            .route("/authorize/{provider}", web::get().to(authorize))
            .route("/callback/{provider}", web::get().to(callback))
            .route("/callback/{provider}", web::post().to(callback))
            .route("/providers", web::get().to(providers))
            .route("/session/refresh", web::post().to(refresh))
            .route("/session/revoke", web::post().to(revoke))
            .service(
                web::resource("/session")
                    .wrap(RequireSession::new(broker.validator.clone()))
                    .route(web::get().to(session_info)),
            ),
    );
}
