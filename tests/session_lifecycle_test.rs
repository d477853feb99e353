//! Refresh rotation, reuse detection and revocation through the HTTP surface

use actix_web::cookie::Cookie;
use actix_web::dev::ServiceResponse;
use actix_web::http::StatusCode;
use actix_web::{test, web, App};
use serde_json::{json, Value};
use signin_broker::error::SessionError;
use signin_broker::models::{Session, VerifiedIdentity};
use signin_broker::oauth::ProviderClient;
use signin_broker::settings::BrokerSettings;
use signin_broker::testing::{fixtures, StubTransport};
use signin_broker::{configure_services, Broker};
use std::sync::Arc;

macro_rules! broker_app {
    ($broker:expr) => {{
        let broker = $broker.clone();
        test::init_service(
            App::new()
                .app_data(broker.clone())
                .configure(move |cfg| configure_services(cfg, &broker)),
        )
        .await
    }};
}

fn broker_with(settings: BrokerSettings) -> web::Data<Broker> {
    let registry = fixtures::test_registry(&settings);
    let client = ProviderClient::new(Arc::new(StubTransport::new()), &settings.http);
    web::Data::new(Broker::with_registry(settings, registry, client).unwrap())
}

fn test_broker() -> web::Data<Broker> {
    broker_with(fixtures::test_settings())
}

fn identity() -> VerifiedIdentity {
    VerifiedIdentity {
        provider_id: fixtures::TEST_PROVIDER_ID.to_string(),
        subject: fixtures::TEST_SUBJECT.to_string(),
        email: Some(fixtures::TEST_EMAIL.to_string()),
        email_verified: true,
        name: Some(fixtures::TEST_NAME.to_string()),
        raw_claims: json!({"sub": fixtures::TEST_SUBJECT}),
    }
}

async fn sign_in(broker: &Broker) -> Session {
    broker.issuer.issue(&identity()).await.unwrap()
}

fn cookie_value<B>(resp: &ServiceResponse<B>, name: &str) -> Option<String> {
    resp.response()
        .cookies()
        .find(|cookie| cookie.name() == name)
        .map(|cookie| cookie.value().to_string())
}

fn refresh_with_header(refresh_token: &str) -> test::TestRequest {
    test::TestRequest::post()
        .uri("/auth/session/refresh")
        .insert_header(("x-refresh-token", refresh_token))
}

#[actix_web::test]
async fn test_refresh_via_cookie_rotates_tokens() {
    let broker = test_broker();
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let req = test::TestRequest::post()
        .uri("/auth/session/refresh")
        .cookie(Cookie::new("sRefreshToken", session.refresh_token.clone()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let new_refresh = cookie_value(&resp, "sRefreshToken").expect("rotated refresh cookie");
    assert_ne!(new_refresh, session.refresh_token);
    assert!(cookie_value(&resp, "sAccessToken").is_some_and(|v| !v.is_empty()));

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["session_id"], session.session_id.to_string());
    assert_eq!(body["refresh_token"], new_refresh.as_str());
    assert!(body["expires_in"].as_i64().unwrap() > 0);
}

#[actix_web::test]
async fn test_refresh_via_header_and_json_body() {
    let broker = test_broker();
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let resp = test::call_service(&app, refresh_with_header(&session.refresh_token).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let rotated = resp
        .headers()
        .get("x-refresh-token")
        .expect("refresh token header")
        .to_str()
        .unwrap()
        .to_string();

    let req = test::TestRequest::post()
        .uri("/auth/session/refresh")
        .set_json(json!({ "refresh_token": rotated }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["session_id"], session.session_id.to_string());
}

#[actix_web::test]
async fn test_refreshed_access_token_authenticates() {
    let broker = test_broker();
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let body: Value =
        test::call_and_read_body_json(&app, refresh_with_header(&session.refresh_token).to_request()).await;
    let access_token = body["access_token"].as_str().unwrap();

    let req = test::TestRequest::get()
        .uri("/auth/session")
        .insert_header(("Authorization", format!("Bearer {access_token}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["principal"]["session_id"], session.session_id.to_string());
    assert_eq!(body["principal"]["user_id"], session.user_id.to_string());
}

#[actix_web::test]
async fn test_refresh_token_reuse_revokes_the_family() {
    let broker = test_broker();
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let body: Value =
        test::call_and_read_body_json(&app, refresh_with_header(&session.refresh_token).to_request()).await;
    let rotated = body["refresh_token"].as_str().unwrap().to_string();
    let rotated_access = body["access_token"].as_str().unwrap().to_string();

    // Presenting the already-rotated token again looks like theft
    let resp = test::call_service(&app, refresh_with_header(&session.refresh_token).to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(cookie_value(&resp, "sRefreshToken").as_deref(), Some(""));
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "token_theft_detected");

    // The legitimate holder's newer tokens die with the family
    let resp = test::call_service(&app, refresh_with_header(&rotated).to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_revoked");

    let req = test::TestRequest::get()
        .uri("/auth/session")
        .insert_header(("Authorization", format!("Bearer {rotated_access}")))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_revoked");
}

#[actix_web::test]
async fn test_refresh_without_token_is_session_missing() {
    let broker = test_broker();
    let app = broker_app!(broker);

    let req = test::TestRequest::post()
        .uri("/auth/session/refresh")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_missing");
}

#[actix_web::test]
async fn test_unknown_refresh_token_is_invalid() {
    let broker = test_broker();
    let app = broker_app!(broker);

    let resp = test::call_service(&app, refresh_with_header("not-a-real-token").to_request()).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_invalid");
}

#[actix_web::test]
async fn test_revoke_signs_out_the_session() {
    let broker = test_broker();
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let req = test::TestRequest::post()
        .uri("/auth/session/revoke")
        .cookie(Cookie::new("sAccessToken", session.access_token.clone()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(cookie_value(&resp, "sAccessToken").as_deref(), Some(""));
    assert_eq!(cookie_value(&resp, "sRefreshToken").as_deref(), Some(""));

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["revoked"], true);
    assert_eq!(body["session_id"], session.session_id.to_string());

    let req = test::TestRequest::get()
        .uri("/auth/session")
        .insert_header(("Authorization", format!("Bearer {}", session.access_token)))
        .to_request();
    let body: Value = test::read_body_json(test::call_service(&app, req).await).await;
    assert_eq!(body["error"], "session_revoked");

    let resp = test::call_service(&app, refresh_with_header(&session.refresh_token).to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_revoked");
}

#[actix_web::test]
async fn test_revoke_requires_a_session() {
    let broker = test_broker();
    let app = broker_app!(broker);

    let req = test::TestRequest::post()
        .uri("/auth/session/revoke")
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_missing");
}

#[actix_web::test]
async fn test_revoke_with_expired_access_token_uses_refresh_token() {
    let mut settings = fixtures::test_settings();
    settings.session.access_token_ttl_seconds = 0;
    let broker = broker_with(settings);
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let req = test::TestRequest::post()
        .uri("/auth/session/revoke")
        .cookie(Cookie::new("sAccessToken", session.access_token.clone()))
        .cookie(Cookie::new("sRefreshToken", session.refresh_token.clone()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(cookie_value(&resp, "sRefreshToken").as_deref(), Some(""));

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["revoked"], true);
    assert_eq!(body["session_id"], session.session_id.to_string());

    let resp = test::call_service(&app, refresh_with_header(&session.refresh_token).to_request()).await;
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_revoked");
}

#[actix_web::test]
async fn test_revoke_with_refresh_header_only() {
    let broker = test_broker();
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let req = test::TestRequest::post()
        .uri("/auth/session/revoke")
        .insert_header(("x-refresh-token", session.refresh_token.clone()))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["revoked"], true);
    assert_eq!(body["session_id"], session.session_id.to_string());

    let req = test::TestRequest::post()
        .uri("/auth/session/revoke")
        .insert_header(("x-refresh-token", "not-a-real-token"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_invalid");
}

#[actix_web::test]
async fn test_expired_access_token_asks_for_refresh() {
    let mut settings = fixtures::test_settings();
    settings.session.access_token_ttl_seconds = 0;
    let broker = broker_with(settings);
    let app = broker_app!(broker);
    let session = sign_in(&broker).await;

    let req = test::TestRequest::get()
        .uri("/auth/session")
        .insert_header(("Authorization", format!("Bearer {}", session.access_token)))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "try_refresh_token");
}

#[actix_web::test]
async fn test_token_from_another_broker_is_invalid() {
    let mut foreign_settings = fixtures::test_settings();
    foreign_settings.session.secret = "a_completely_different_signing_key".to_string();
    let foreign = broker_with(foreign_settings);
    let foreign_session = sign_in(&foreign).await;

    let broker = test_broker();
    let app = broker_app!(broker);

    let req = test::TestRequest::get()
        .uri("/auth/session")
        .insert_header((
            "Authorization",
            format!("Bearer {}", foreign_session.access_token),
        ))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "session_invalid");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_refresh_has_a_single_winner() {
    let broker = test_broker();
    let session = sign_in(&broker).await;

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let issuer = broker.issuer.clone();
            let token = session.refresh_token.clone();
            tokio::spawn(async move { issuer.refresh(&token).await })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(SessionError::RefreshTokenReused { .. } | SessionError::Revoked) => {}
            Err(other) => panic!("unexpected refresh error: {other}"),
        }
    }
    assert_eq!(winners, 1);
}
