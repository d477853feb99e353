// Sign-in start and provider callback
use crate::broker::Broker;
use crate::error::{BrokerError, FlowError};
use crate::models::{AppleUserInfo, Session};
use crate::utils::logging::LoggingHelper;
use crate::utils::responses::ResponseBuilder;
use actix_web::{web, HttpRequest, HttpResponse};
use log::{debug, warn};
use serde::Deserialize;
use serde_json::Value;

use super::{ACCESS_TOKEN_HEADER, REFRESH_TOKEN_HEADER};

#[derive(Debug, Deserialize)]
pub struct AuthorizeQuery {
    /// Where to send the user after sign-in
    pub rd: Option<String>,
}

/// Callback parameters, from the query string or (Apple `form_post`) the body
#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
    /// Apple's first-login user JSON
    pub user: Option<String>,
}

/// `GET {base}/authorize/{provider}`: redirect the browser to the provider
///
/// # Errors
///
/// Unknown providers answer 404; a store failure answers 500
pub async fn authorize(
    path: web::Path<String>,
    query: web::Query<AuthorizeQuery>,
    broker: web::Data<Broker>,
) -> Result<HttpResponse, BrokerError> {
    let provider_id = path.into_inner();
    let (authorization_url, _) = broker
        .exchanger
        .begin_login(&provider_id, query.rd.as_deref())
        .await?;

    Ok(ResponseBuilder::redirect(&authorization_url).build())
}

/// `GET|POST {base}/callback/{provider}`: finish sign-in and hand the session to the browser
pub async fn callback(
    req: HttpRequest,
    path: web::Path<String>,
    query: web::Query<CallbackParams>,
    form: Option<web::Form<CallbackParams>>,
    broker: web::Data<Broker>,
) -> HttpResponse {
    let provider_id = path.into_inner();
    let params = match form {
        Some(form) => {
            debug!("Callback for {provider_id} received via form_post");
            form.into_inner()
        }
        None => query.into_inner(),
    };
    LoggingHelper::log_callback_debug(&req, &provider_id, params.code.is_some());

    match complete_sign_in(&broker, &provider_id, params).await {
        Ok((session, redirect_to)) => {
            broker
                .activity
                .record_success(&provider_id, session.user_id);
            let app = &broker.settings.application;
            // Relative targets are paths on the website, not on this API
            let location = match redirect_to {
                Some(path) if path.starts_with('/') => {
                    format!("{}{path}", app.website_base_url.trim_end_matches('/'))
                }
                Some(url) => url,
                None => app.post_login_url(),
            };

            let mut response = ResponseBuilder::redirect(&location)
                .with_cookies(broker.cookies.session_cookies(&session));
            if broker.settings.session.expose_token_headers {
                response = response
                    .with_header(ACCESS_TOKEN_HEADER, &session.access_token)
                    .with_header(REFRESH_TOKEN_HEADER, &session.refresh_token);
            }
            response.build()
        }
        Err(e) => {
            warn!("Sign-in with {provider_id} failed: {e}");
            broker.activity.record_failure(&provider_id, e.code());
            ResponseBuilder::redirect(&broker.settings.application.website_login_url())
                .with_error(e.code())
                .build()
        }
    }
}

async fn complete_sign_in(
    broker: &Broker,
    provider_id: &str,
    params: CallbackParams,
) -> Result<(Session, Option<String>), BrokerError> {
    if let Some(error) = params.error {
        debug!(
            "Provider {provider_id} denied authorization: {error} ({})",
            params.error_description.as_deref().unwrap_or("no description")
        );
        return Err(FlowError::ProviderDenied {
            provider: provider_id.to_string(),
            error,
        }
        .into());
    }
    let code = params.code.ok_or(FlowError::MissingParameter("code"))?;
    let state = params.state.ok_or(FlowError::MissingParameter("state"))?;

    let (tokens, login) = broker
        .exchanger
        .complete_login(provider_id, &code, &state)
        .await?;
    let provider = broker.registry.lookup(provider_id)?;

    let apple_user = params
        .user
        .and_then(|user| AppleUserInfo::from_callback_value(&Value::String(user)));
    let identity = broker
        .verifier
        .verify(&provider, &tokens, &login.nonce, apple_user.as_ref())
        .await?;

    let session = broker.issuer.issue(&identity).await?;
    Ok((session, login.redirect_to))
}
