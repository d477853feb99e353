//! Access-token validation and the `RequireSession` middleware
//!
//! Validation is read-only: it checks the token itself and looks up the
//! session family to reject revoked sessions, but never refreshes or rotates.

use crate::error::SessionError;
use crate::models::Principal;
use crate::session::store::SessionStore;
use crate::session::tokens::AccessTokenSigner;
use actix_web::body::EitherBody;
use actix_web::dev::{forward_ready, Payload, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::AUTHORIZATION;
use actix_web::{Error, FromRequest, HttpMessage, HttpRequest, ResponseError};
use chrono::Utc;
use std::future::{ready, Future, Ready};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Clone)]
pub struct SessionValidator {
    signer: AccessTokenSigner,
    sessions: Arc<dyn SessionStore>,
    access_cookie_name: String,
}

impl SessionValidator {
    #[must_use]
    pub fn new(
        signer: AccessTokenSigner,
        sessions: Arc<dyn SessionStore>,
        access_cookie_name: String,
    ) -> Self {
        Self {
            signer,
            sessions,
            access_cookie_name,
        }
    }

    /// Validate an access token and resolve the caller
    ///
    /// # Errors
    ///
    /// - `SessionError::Expired` at or after the token's `exp`
    /// - `SessionError::Invalid` for bad format, signature or claims
    /// - `SessionError::Revoked` if the session family was revoked
    pub async fn validate(&self, token: &str) -> Result<Principal, SessionError> {
        let claims = self.signer.verify(token, Utc::now())?;

        let session_id = Uuid::parse_str(&claims.sid)
            .map_err(|_| SessionError::Invalid("malformed sid".to_string()))?;
        let user_id = Uuid::parse_str(&claims.sub)
            .map_err(|_| SessionError::Invalid("malformed sub".to_string()))?;

        let record = self
            .sessions
            .get_session(session_id)
            .await?
            .ok_or_else(|| SessionError::Invalid("unknown session".to_string()))?;
        if record.is_revoked() {
            return Err(SessionError::Revoked);
        }

        Ok(Principal {
            user_id,
            session_id,
            expires_at: claims.expires_at(),
            provider_id: claims.idp,
            subject: claims.idp_sub,
            email: claims.email,
        })
    }

    /// Extract and validate the request's access token
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Missing` if no token is present, otherwise as [`Self::validate`]
    pub async fn validate_request(&self, req: &HttpRequest) -> Result<Principal, SessionError> {
        let token =
            extract_access_token(req, &self.access_cookie_name).ok_or(SessionError::Missing)?;
        self.validate(&token).await
    }
}

/// Access token from `Authorization: Bearer`, falling back to the access cookie
#[must_use]
pub fn extract_access_token(req: &HttpRequest, cookie_name: &str) -> Option<String> {
    let bearer = req
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty());

    if let Some(token) = bearer {
        return Some(token.to_string());
    }

    req.cookie(cookie_name)
        .map(|cookie| cookie.value().to_string())
        .filter(|value| !value.is_empty())
}

/// Middleware rejecting requests without a valid session with a 401
pub struct RequireSession {
    validator: SessionValidator,
}

impl RequireSession {
    #[must_use]
    pub fn new(validator: SessionValidator) -> Self {
        Self { validator }
    }
}

impl<S, B> Transform<S, ServiceRequest> for RequireSession
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = RequireSessionMiddleware<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(RequireSessionMiddleware {
            service: Rc::new(service),
            validator: self.validator.clone(),
        }))
    }
}

pub struct RequireSessionMiddleware<S> {
    service: Rc<S>,
    validator: SessionValidator,
}

impl<S, B> Service<ServiceRequest> for RequireSessionMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let validator = self.validator.clone();

        Box::pin(async move {
            match validator.validate_request(req.request()).await {
                Ok(principal) => {
                    req.extensions_mut().insert(principal);
                    let response = service.call(req).await?;
                    Ok(response.map_into_left_body())
                }
                Err(err) => {
                    log::debug!("Rejected request to {}: {err}", req.path());
                    let response = err.error_response();
                    Ok(req.into_response(response).map_into_right_body())
                }
            }
        })
    }
}

/// Handlers behind `RequireSession` take the caller as an argument
impl FromRequest for Principal {
    type Error = SessionError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _payload: &mut Payload) -> Self::Future {
        ready(
            req.extensions()
                .get::<Principal>()
                .cloned()
                .ok_or(SessionError::Missing),
        )
    }
}
