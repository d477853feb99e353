// Centralized log events for the sign-in flow. Token values are never logged,
// only their presence.
use crate::models::{ProviderTokens, Session, VerifiedIdentity};
use crate::registry::ProviderConfig;
use log::{debug, info, warn};
use uuid::Uuid;

pub struct LoggingHelper;

impl LoggingHelper {
    pub fn log_provider_initialization() {
        info!("🔧 Initializing sign-in providers from configuration...");
    }

    pub fn log_provider_disabled(provider_id: &str) {
        info!("⏭️  Provider {provider_id} is disabled, skipping");
    }

    pub fn log_provider_configured(config: &ProviderConfig) {
        info!(
            "✅ {} configured ({}, adapter={}, pkce={}, scopes={})",
            config.display_name,
            config.id,
            config.adapter,
            config.use_pkce,
            config.scopes.join(" ")
        );
    }

    pub fn log_providers_summary(provider_ids: &[String]) {
        info!("🎯 Configured sign-in providers: {provider_ids:?}");
    }

    pub fn log_authorization_url_built(provider: &str, scopes: &[String], pkce: bool) {
        debug!(
            "🔍 Built {provider} authorization URL with scopes '{}' (pkce={pkce})",
            scopes.join(" ")
        );
    }

    pub fn log_token_exchange_start(provider: &str) {
        info!("🔄 Exchanging authorization code for tokens with {provider}");
    }

    pub fn log_token_exchange_summary(provider: &str, tokens: &ProviderTokens) {
        info!(
            "🔍 Token exchange summary for {provider}: id_token={}, refresh_token={}, token_type={}, scope={:?}",
            if tokens.id_token.is_some() { "present" } else { "missing" },
            if tokens.refresh_token.is_some() { "present" } else { "missing" },
            tokens.token_type,
            tokens.scope
        );
    }

    pub fn log_identity_verified(identity: &VerifiedIdentity) {
        info!(
            "🪪 Verified {} identity (email verified: {})",
            identity.provider_id, identity.email_verified
        );
        debug!("Verified subject: {}", identity.subject);
    }

    pub fn log_session_issued(session: &Session, provider: &str) {
        info!(
            "Issued session {} for user {} (provider: {provider})",
            session.session_id, session.user_id
        );
    }

    pub fn log_session_refreshed(session: &Session) {
        debug!(
            "Rotated refresh token for session {} to generation {}",
            session.session_id, session.generation
        );
    }

    /// Security event: a rotated refresh token was presented again
    pub fn log_refresh_token_reuse(session_id: Uuid, generation: u32) {
        warn!(
            "🚨 Refresh token reuse detected for session {session_id} (generation {generation}); revoking the session"
        );
    }

    pub fn log_session_revoked(session_id: Uuid, reason: &str) {
        info!("Revoked session {session_id} ({reason})");
    }

    pub fn log_callback_debug(req: &actix_web::HttpRequest, provider: &str, has_code: bool) {
        debug!(
            "Callback for {provider} received via {} (code present: {has_code})",
            req.method()
        );
        debug!("Callback request connection info: {:?}", req.connection_info());
    }
}
