use crate::error::SessionError;
use crate::models::{Session, VerifiedIdentity};
use crate::session::store::{
    RefreshTokenRecord, RefreshTokenStatus, RotateOutcome, SessionRecord, SessionStore,
    UserStore,
};
use crate::session::tokens::{AccessTokenSigner, AccessTokenSubject};
use crate::settings::ttl_from_seconds;
use crate::utils::crypto::{generate_random_token, hash_token, REFRESH_TOKEN_BYTES};
use crate::utils::logging::LoggingHelper;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub const REVOKE_REASON_SIGN_OUT: &str = "sign_out";
pub const REVOKE_REASON_REUSE: &str = "refresh_token_reuse";

/// Issues, rotates and revokes first-party sessions
///
/// A session is a refresh-token family: `session_id` stays fixed while each
/// refresh replaces the single active refresh token with a new one one
/// generation higher. Presenting a rotated token revokes the whole family.
#[derive(Clone)]
pub struct SessionIssuer {
    users: Arc<dyn UserStore>,
    sessions: Arc<dyn SessionStore>,
    signer: AccessTokenSigner,
    refresh_ttl: Duration,
    link_by_verified_email: bool,
}

impl SessionIssuer {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserStore>,
        sessions: Arc<dyn SessionStore>,
        signer: AccessTokenSigner,
        refresh_ttl_hours: u64,
        link_by_verified_email: bool,
    ) -> Self {
        Self {
            users,
            sessions,
            signer,
            refresh_ttl: ttl_from_seconds(refresh_ttl_hours.saturating_mul(3600)),
            link_by_verified_email,
        }
    }

    #[must_use]
    pub fn signer(&self) -> &AccessTokenSigner {
        &self.signer
    }

    /// Start a new session for a verified identity
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Store` or `SessionError::Signing` on backend failures
    pub async fn issue(&self, identity: &VerifiedIdentity) -> Result<Session, SessionError> {
        let now = Utc::now();
        let resolution = self
            .users
            .resolve_or_create(identity, self.link_by_verified_email)
            .await?;
        let user_id = resolution.user.user_id;
        let session_id = Uuid::new_v4();

        let refresh_token = generate_random_token(REFRESH_TOKEN_BYTES);
        let refresh_expires_at = now + self.refresh_ttl;

        let (access_token, access_expires_at) = self.signer.sign(
            &AccessTokenSubject {
                user_id,
                session_id,
                provider_id: &identity.provider_id,
                subject: &identity.subject,
                email: identity.email.as_deref(),
                generation: 0,
            },
            now,
        )?;

        self.sessions
            .create_session(
                SessionRecord {
                    session_id,
                    user_id,
                    provider_id: identity.provider_id.clone(),
                    subject: identity.subject.clone(),
                    email: identity.email.clone(),
                    created_at: now,
                    expires_at: refresh_expires_at,
                    revoked_at: None,
                    revoked_reason: None,
                },
                new_token_record(&refresh_token, session_id, 0, now, refresh_expires_at),
            )
            .await?;

        let session = Session {
            session_id,
            user_id,
            access_token,
            refresh_token,
            access_expires_at,
            refresh_expires_at,
            created_at: now,
            generation: 0,
        };
        LoggingHelper::log_session_issued(&session, &identity.provider_id);
        Ok(session)
    }

    /// Exchange a refresh token for a new token pair
    ///
    /// # Errors
    ///
    /// - `SessionError::RefreshTokenInvalid` for unknown tokens
    /// - `SessionError::RefreshTokenReused` when a rotated token is presented; the
    ///   session is revoked before returning
    /// - `SessionError::Revoked` / `SessionError::Expired` for dead families
    pub async fn refresh(&self, refresh_token: &str) -> Result<Session, SessionError> {
        let now = Utc::now();
        let presented_hash = hash_token(refresh_token);

        let next_token = generate_random_token(REFRESH_TOKEN_BYTES);
        let refresh_expires_at = now + self.refresh_ttl;
        // Family id and generation are assigned by the store on rotation
        let replacement = new_token_record(&next_token, Uuid::nil(), 0, now, refresh_expires_at);

        let previous = match self
            .sessions
            .rotate_refresh_token(&presented_hash, replacement, now)
            .await?
        {
            RotateOutcome::Rotated { previous } => previous,
            RotateOutcome::NotFound => return Err(SessionError::RefreshTokenInvalid),
            RotateOutcome::AlreadyRotated(record) => {
                LoggingHelper::log_refresh_token_reuse(record.session_id, record.generation);
                self.sessions
                    .revoke_session(record.session_id, REVOKE_REASON_REUSE, now)
                    .await?;
                return Err(SessionError::RefreshTokenReused {
                    session_id: record.session_id,
                    generation: record.generation,
                });
            }
            RotateOutcome::Revoked(_) => return Err(SessionError::Revoked),
            RotateOutcome::Expired(_) => return Err(SessionError::Expired),
        };

        let record = self
            .sessions
            .get_session(previous.session_id)
            .await?
            .ok_or(SessionError::RefreshTokenInvalid)?;
        let generation = previous.generation + 1;

        let (access_token, access_expires_at) = self.signer.sign(
            &AccessTokenSubject {
                user_id: record.user_id,
                session_id: record.session_id,
                provider_id: &record.provider_id,
                subject: &record.subject,
                email: record.email.as_deref(),
                generation,
            },
            now,
        )?;

        let session = Session {
            session_id: record.session_id,
            user_id: record.user_id,
            access_token,
            refresh_token: next_token,
            access_expires_at,
            refresh_expires_at,
            created_at: record.created_at,
            generation,
        };
        LoggingHelper::log_session_refreshed(&session);
        Ok(session)
    }

    /// Session family a refresh token belongs to, whatever the token's status
    ///
    /// # Errors
    ///
    /// Returns `SessionError::RefreshTokenInvalid` for unknown tokens
    pub async fn session_for_refresh_token(&self, refresh_token: &str) -> Result<Uuid, SessionError> {
        self.sessions
            .find_refresh_token(&hash_token(refresh_token))
            .await?
            .map(|record| record.session_id)
            .ok_or(SessionError::RefreshTokenInvalid)
    }

    /// Revoke a session and every refresh token in its family; idempotent
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnknownSession` if the session does not exist
    pub async fn revoke(&self, session_id: Uuid, reason: &str) -> Result<SessionRecord, SessionError> {
        let record = self
            .sessions
            .revoke_session(session_id, reason, Utc::now())
            .await?
            .ok_or(SessionError::UnknownSession(session_id))?;
        LoggingHelper::log_session_revoked(session_id, reason);
        Ok(record)
    }
}

fn new_token_record(
    token: &str,
    session_id: Uuid,
    generation: u32,
    issued_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> RefreshTokenRecord {
    RefreshTokenRecord {
        token_hash: hash_token(token),
        session_id,
        generation,
        issued_at,
        expires_at,
        status: RefreshTokenStatus::Active,
    }
}
