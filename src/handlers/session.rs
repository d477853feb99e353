// Session refresh, revocation and introspection
use crate::broker::Broker;
use crate::error::SessionError;
use crate::models::{Principal, Session};
use crate::session::issuer::REVOKE_REASON_SIGN_OUT;
use crate::utils::responses::ResponseBuilder;
use actix_web::{http::StatusCode, web, HttpRequest, HttpResponse, ResponseError};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{ACCESS_TOKEN_HEADER, REFRESH_TOKEN_HEADER};

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: Option<String>,
}

/// Token pair as returned to API clients
#[derive(Debug, Serialize)]
pub struct TokenResponse<'a> {
    pub access_token: &'a str,
    pub refresh_token: &'a str,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
    pub session_id: Uuid,
}

impl<'a> TokenResponse<'a> {
    fn from_session(session: &'a Session) -> Self {
        Self {
            access_token: &session.access_token,
            refresh_token: &session.refresh_token,
            token_type: "Bearer",
            expires_in: (session.access_expires_at - Utc::now()).num_seconds().max(0),
            access_expires_at: session.access_expires_at,
            refresh_expires_at: session.refresh_expires_at,
            session_id: session.session_id,
        }
    }
}

/// Refresh token from the refresh cookie, the `x-refresh-token` header or the JSON body, in that order
fn extract_refresh_token(
    req: &HttpRequest,
    cookie_name: &str,
    body: Option<web::Json<RefreshRequest>>,
) -> Option<String> {
    req.cookie(cookie_name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| {
            req.headers()
                .get(REFRESH_TOKEN_HEADER)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
                .filter(|value| !value.is_empty())
        })
        .or_else(|| body.and_then(|body| body.into_inner().refresh_token))
        .filter(|value| !value.is_empty())
}

/// Session failures answer 401 and clear the session cookies
fn session_failure(broker: &Broker, error: &SessionError, code: &str) -> HttpResponse {
    if error.status_code() != StatusCode::UNAUTHORIZED {
        return error.error_response();
    }
    ResponseBuilder::unauthorized()
        .with_error_code(code)
        .with_cookies(broker.cookies.removal_cookies())
        .build()
}

/// `POST {base}/session/refresh`: rotate the refresh token and issue a new pair
pub async fn refresh(
    req: HttpRequest,
    body: Option<web::Json<RefreshRequest>>,
    broker: web::Data<Broker>,
) -> HttpResponse {
    let Some(refresh_token) =
        extract_refresh_token(&req, broker.cookies.refresh_cookie_name(), body)
    else {
        return session_failure(&broker, &SessionError::Missing, SessionError::Missing.code());
    };

    match broker.issuer.refresh(&refresh_token).await {
        Ok(session) => {
            let mut response =
                ResponseBuilder::ok().with_cookies(broker.cookies.session_cookies(&session));
            if broker.settings.session.expose_token_headers {
                response = response
                    .with_header(ACCESS_TOKEN_HEADER, &session.access_token)
                    .with_header(REFRESH_TOKEN_HEADER, &session.refresh_token);
            }
            response.json(&TokenResponse::from_session(&session))
        }
        Err(e) => {
            warn!("Session refresh failed: {e}");
            // An expired refresh token cannot be refreshed again
            let code = match e {
                SessionError::Expired => "session_expired",
                _ => e.code(),
            };
            session_failure(&broker, &e, code)
        }
    }
}

/// `POST {base}/session/revoke`: sign out the caller's session everywhere
///
/// Without a live access token the refresh token (cookie or header) names the
/// session, so clients can sign out after their access token expired.
pub async fn revoke(req: HttpRequest, broker: web::Data<Broker>) -> HttpResponse {
    let session_id = match broker.validator.validate_request(&req).await {
        Ok(principal) => principal.session_id,
        Err(e @ (SessionError::Missing | SessionError::Expired)) => {
            let Some(refresh_token) =
                extract_refresh_token(&req, broker.cookies.refresh_cookie_name(), None)
            else {
                return session_failure(&broker, &e, e.code());
            };
            match broker.issuer.session_for_refresh_token(&refresh_token).await {
                Ok(session_id) => session_id,
                Err(e) => return session_failure(&broker, &e, e.code()),
            }
        }
        Err(e) => return session_failure(&broker, &e, e.code()),
    };

    match broker
        .issuer
        .revoke(session_id, REVOKE_REASON_SIGN_OUT)
        .await
    {
        Ok(record) => ResponseBuilder::ok()
            .with_cookies(broker.cookies.removal_cookies())
            .json(&json!({
                "revoked": true,
                "session_id": record.session_id,
                "revoked_at": record.revoked_at,
            })),
        Err(e) => session_failure(&broker, &e, e.code()),
    }
}

/// `GET {base}/session`: the authenticated caller and their recent sign-in activity
pub async fn session_info(principal: Principal, broker: web::Data<Broker>) -> HttpResponse {
    let activity = broker.activity.snapshot_for(principal.user_id);
    HttpResponse::Ok().json(json!({
        "principal": principal,
        "activity": activity,
    }))
}
