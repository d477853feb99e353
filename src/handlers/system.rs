use crate::broker::Broker;
use crate::models::HealthResponse;
use actix_web::{web, HttpResponse};

pub async fn ping() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        message: "Sign-in broker is running".to_string(),
    })
}

/// Configured providers, in configuration order
pub async fn providers(broker: web::Data<Broker>) -> HttpResponse {
    HttpResponse::Ok().json(broker.registry.summaries())
}
