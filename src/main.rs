#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![deny(warnings)]
#![allow(clippy::multiple_crate_versions)]

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use signin_broker::{
    handlers::{configure_services, ACCESS_TOKEN_HEADER, REFRESH_TOKEN_HEADER},
    oauth::ReqwestTransport,
    settings::BrokerSettings,
    Broker,
};
use std::sync::Arc;
use std::time::Duration;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Load configuration from Settings.toml and environment variables
    // This also loads .env file and initializes the logger
    let settings = BrokerSettings::load()
        .map_err(|e| std::io::Error::other(format!("Failed to load settings: {e}")))?;

    let transport = ReqwestTransport::new(&settings.http)
        .map_err(|e| std::io::Error::other(format!("Failed to build HTTP client: {e}")))?;

    // A broker with a broken provider configuration must not start
    let broker = Broker::from_settings(settings, Arc::new(transport))
        .await
        .map_err(|e| std::io::Error::other(format!("Failed to initialize providers: {e}")))?;

    start_server(web::Data::new(broker)).await
}

/// Start the HTTP server and the expiry sweeper
///
/// # Errors
///
/// Returns an error if:
/// - Server binding fails
/// - Server fails to start
async fn start_server(broker: web::Data<Broker>) -> std::io::Result<()> {
    let bind_address = broker.settings.get_bind_address();
    print_startup_info(&bind_address, &broker);
    spawn_sweeper(broker.clone());

    let cors_origins = broker.settings.get_cors_origins();

    HttpServer::new(move || {
        let cors_origins = cors_origins.clone();
        let cors = Cors::default()
            .allowed_origin_fn(move |origin, _| {
                cors_origins
                    .iter()
                    .any(|allowed| allowed == origin.to_str().unwrap_or(""))
            })
            .allowed_methods(vec!["GET", "POST", "OPTIONS"])
            .allowed_headers(vec![
                "Authorization",
                "Content-Type",
                "Accept",
                REFRESH_TOKEN_HEADER,
            ])
            .expose_headers(vec![ACCESS_TOKEN_HEADER, REFRESH_TOKEN_HEADER])
            .supports_credentials()
            .max_age(3600);

        let broker = broker.clone();
        App::new()
            .app_data(broker.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .configure(move |cfg| configure_services(cfg, &broker))
    })
    .bind(&bind_address)?
    .run()
    .await
}

/// Periodically drop expired authorization states and refresh tokens
fn spawn_sweeper(broker: web::Data<Broker>) {
    let interval_seconds = broker.settings.session.sweep_interval_seconds;
    if interval_seconds == 0 {
        log::info!("Expiry sweeper disabled");
        return;
    }

    actix_web::rt::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_seconds));
        loop {
            interval.tick().await;
            broker.sweep_expired().await;
        }
    });
}

fn print_startup_info(bind_address: &str, broker: &Broker) {
    let app = &broker.settings.application;
    let base = app.api_base_path();

    println!("Starting {} on http://{bind_address}", app.app_name);
    println!();
    println!("Sign-in endpoints:");
    println!("  GET      {base}/authorize/{{provider}}?rd=<path> - Start sign-in");
    println!("  GET|POST {base}/callback/{{provider}}           - Provider callback");
    println!("  GET      {base}/providers                       - Configured providers");
    println!();
    println!("Session endpoints:");
    println!("  POST     {base}/session/refresh - Rotate the refresh token");
    println!("  POST     {base}/session/revoke  - Sign out");
    println!("  GET      {base}/session         - Current session and sign-in activity");
    println!();
    println!("Callback URLs to register with identity providers:");
    for provider in broker.registry.summaries() {
        println!("  {}", app.callback_url(&provider.id));
    }
    println!();
    println!("System endpoints:");
    println!("  GET  /ping - Health check");
}
