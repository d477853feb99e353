//! Persistence seams for pending logins, sessions and users
//!
//! Each concern sits behind an async trait so a database-backed store can be
//! swapped in. The in-memory implementations use `DashMap`, whose per-shard
//! locks make single-use state removal and refresh-token rotation atomic.

use crate::error::StoreError;
use crate::models::{AuthorizationRequestState, VerifiedIdentity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ===============================
// RECORDS
// ===============================

/// Stored session; `session_id` is also the refresh-token family id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub provider_id: String,
    pub subject: String,
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revoked_reason: Option<String>,
}

impl SessionRecord {
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshTokenStatus {
    Active,
    Rotated { at: DateTime<Utc> },
    Revoked { at: DateTime<Utc> },
}

/// Stored refresh token, keyed by the hash of the opaque token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshTokenRecord {
    pub token_hash: String,
    pub session_id: Uuid,
    pub generation: u32,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: RefreshTokenStatus,
}

/// Result of a compare-and-rotate on a refresh token
#[derive(Debug, Clone)]
pub enum RotateOutcome {
    /// The presented token was active and is now rotated; the new token is stored
    Rotated { previous: RefreshTokenRecord },
    NotFound,
    /// The presented token had already been rotated: a replay
    AlreadyRotated(RefreshTokenRecord),
    /// The token or its session has been revoked
    Revoked(RefreshTokenRecord),
    Expired(RefreshTokenRecord),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LinkedIdentity {
    pub provider_id: String,
    pub subject: String,
    pub linked_at: DateTime<Utc>,
}

/// A first-party user and the provider identities linked to it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub email: Option<String>,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub identities: Vec<LinkedIdentity>,
}

#[derive(Debug, Clone)]
pub struct UserResolution {
    pub user: UserRecord,
    pub created: bool,
    /// The identity was newly attached to an existing user by verified email
    pub linked: bool,
}

// ===============================
// TRAITS
// ===============================

#[async_trait]
pub trait AuthStateStore: Send + Sync {
    async fn put(&self, state: AuthorizationRequestState) -> Result<(), StoreError>;

    /// Remove and return the state in one atomic step
    async fn take(&self, state: &str) -> Result<Option<AuthorizationRequestState>, StoreError>;

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(
        &self,
        session: SessionRecord,
        token: RefreshTokenRecord,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError>;

    /// Stored refresh token by hash, in any status
    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError>;

    /// Atomically move the token with `presented_hash` from `Active` to `Rotated`
    /// and store `replacement`; any other state is reported without changes.
    /// The replacement inherits the family id and gets the next generation.
    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        replacement: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError>;

    /// Mark the session and its active refresh tokens revoked. Returns `None`
    /// for unknown sessions; revoking twice keeps the first revocation.
    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError>;

    /// Drop expired refresh tokens and sessions
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Find the user linked to `(provider_id, subject)` or create one
    ///
    /// With `link_by_verified_email`, an unseen identity carrying a verified
    /// email is attached to the existing user with that email.
    async fn resolve_or_create(
        &self,
        identity: &VerifiedIdentity,
        link_by_verified_email: bool,
    ) -> Result<UserResolution, StoreError>;
}

// ===============================
// IN-MEMORY IMPLEMENTATIONS
// ===============================

#[derive(Default)]
pub struct InMemoryAuthStateStore {
    states: DashMap<String, AuthorizationRequestState>,
}

impl InMemoryAuthStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.states.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[async_trait]
impl AuthStateStore for InMemoryAuthStateStore {
    async fn put(&self, state: AuthorizationRequestState) -> Result<(), StoreError> {
        self.states.insert(state.state.clone(), state);
        Ok(())
    }

    async fn take(&self, state: &str) -> Result<Option<AuthorizationRequestState>, StoreError> {
        Ok(self.states.remove(state).map(|(_, v)| v))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.states.len();
        self.states.retain(|_, s| !s.is_expired_at(now));
        Ok(before.saturating_sub(self.states.len()))
    }
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, SessionRecord>,
    refresh_tokens: DashMap<String, RefreshTokenRecord>,
}

impl InMemorySessionStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored refresh token
    #[must_use]
    pub fn refresh_token(&self, token_hash: &str) -> Option<RefreshTokenRecord> {
        self.refresh_tokens.get(token_hash).map(|r| r.clone())
    }

    /// Refresh tokens of a session family that are still `Active`
    #[must_use]
    pub fn active_token_count(&self, session_id: Uuid) -> usize {
        self.refresh_tokens
            .iter()
            .filter(|r| r.session_id == session_id && r.status == RefreshTokenStatus::Active)
            .count()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_session(
        &self,
        session: SessionRecord,
        token: RefreshTokenRecord,
    ) -> Result<(), StoreError> {
        if self.sessions.contains_key(&session.session_id) {
            return Err(StoreError(format!(
                "session {} already exists",
                session.session_id
            )));
        }
        self.sessions.insert(session.session_id, session);
        self.refresh_tokens.insert(token.token_hash.clone(), token);
        Ok(())
    }

    async fn get_session(&self, session_id: Uuid) -> Result<Option<SessionRecord>, StoreError> {
        Ok(self.sessions.get(&session_id).map(|s| s.clone()))
    }

    async fn find_refresh_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<RefreshTokenRecord>, StoreError> {
        Ok(self.refresh_token(token_hash))
    }

    async fn rotate_refresh_token(
        &self,
        presented_hash: &str,
        replacement: RefreshTokenRecord,
        now: DateTime<Utc>,
    ) -> Result<RotateOutcome, StoreError> {
        let previous = {
            let Some(mut entry) = self.refresh_tokens.get_mut(presented_hash) else {
                return Ok(RotateOutcome::NotFound);
            };

            match entry.status {
                RefreshTokenStatus::Rotated { .. } => {
                    return Ok(RotateOutcome::AlreadyRotated(entry.clone()))
                }
                RefreshTokenStatus::Revoked { .. } => {
                    return Ok(RotateOutcome::Revoked(entry.clone()))
                }
                RefreshTokenStatus::Active => {}
            }

            let session_revoked = self
                .sessions
                .get(&entry.session_id)
                .is_none_or(|s| s.is_revoked());
            if session_revoked {
                return Ok(RotateOutcome::Revoked(entry.clone()));
            }
            if now >= entry.expires_at {
                return Ok(RotateOutcome::Expired(entry.clone()));
            }

            // The status flip happens under the shard write lock, so exactly
            // one concurrent caller can observe `Active` here
            entry.status = RefreshTokenStatus::Rotated { at: now };
            entry.clone()
        };

        let mut replacement = replacement;
        replacement.session_id = previous.session_id;
        replacement.generation = previous.generation + 1;

        // Guard dropped above: the replacement may hash to the same shard
        if let Some(mut session) = self.sessions.get_mut(&previous.session_id) {
            session.expires_at = replacement.expires_at;
        }
        let replacement_hash = replacement.token_hash.clone();
        self.refresh_tokens
            .insert(replacement_hash.clone(), replacement);

        // A revocation that landed between the status flip and the insert did
        // not see the replacement
        let revoked_meanwhile = self
            .sessions
            .get(&previous.session_id)
            .is_none_or(|s| s.is_revoked());
        if revoked_meanwhile {
            if let Some(mut token) = self.refresh_tokens.get_mut(&replacement_hash) {
                token.status = RefreshTokenStatus::Revoked { at: now };
            }
            return Ok(RotateOutcome::Revoked(previous));
        }

        Ok(RotateOutcome::Rotated { previous })
    }

    async fn revoke_session(
        &self,
        session_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let record = {
            let Some(mut session) = self.sessions.get_mut(&session_id) else {
                return Ok(None);
            };
            if session.revoked_at.is_none() {
                session.revoked_at = Some(now);
                session.revoked_reason = Some(reason.to_string());
            }
            session.clone()
        };

        for mut token in self.refresh_tokens.iter_mut() {
            if token.session_id == session_id && token.status == RefreshTokenStatus::Active {
                token.status = RefreshTokenStatus::Revoked { at: now };
            }
        }

        Ok(Some(record))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let before = self.refresh_tokens.len() + self.sessions.len();
        self.refresh_tokens.retain(|_, t| now < t.expires_at);
        self.sessions.retain(|_, s| now < s.expires_at);
        Ok(before.saturating_sub(self.refresh_tokens.len() + self.sessions.len()))
    }
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: DashMap<Uuid, UserRecord>,
    identities: DashMap<(String, String), Uuid>,
    verified_emails: DashMap<String, Uuid>,
}

impl InMemoryUserStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn resolve_or_create(
        &self,
        identity: &VerifiedIdentity,
        link_by_verified_email: bool,
    ) -> Result<UserResolution, StoreError> {
        let key = (identity.provider_id.clone(), identity.subject.clone());
        let verified_email = identity
            .email
            .as_ref()
            .filter(|_| identity.email_verified)
            .map(|e| e.to_lowercase());

        // The vacant entry holds the identity's shard lock until the user exists,
        // so concurrent first logins of one identity resolve to one user
        match self.identities.entry(key) {
            Entry::Occupied(entry) => {
                let user_id = *entry.get();
                let user = self
                    .users
                    .get(&user_id)
                    .map(|u| u.clone())
                    .ok_or_else(|| StoreError(format!("dangling identity link to {user_id}")))?;
                Ok(UserResolution {
                    user,
                    created: false,
                    linked: false,
                })
            }
            Entry::Vacant(entry) => {
                let now = Utc::now();
                let link = LinkedIdentity {
                    provider_id: identity.provider_id.clone(),
                    subject: identity.subject.clone(),
                    linked_at: now,
                };

                let existing = if link_by_verified_email {
                    verified_email
                        .as_ref()
                        .and_then(|email| self.verified_emails.get(email).map(|id| *id))
                } else {
                    None
                };

                if let Some(user_id) = existing {
                    if let Some(mut user) = self.users.get_mut(&user_id) {
                        user.identities.push(link);
                        let user = user.clone();
                        entry.insert(user_id);
                        return Ok(UserResolution {
                            user,
                            created: false,
                            linked: true,
                        });
                    }
                }

                let user = UserRecord {
                    user_id: Uuid::new_v4(),
                    email: identity.email.clone(),
                    name: identity.name.clone(),
                    created_at: now,
                    identities: vec![link],
                };
                if let Some(email) = verified_email {
                    self.verified_emails.entry(email).or_insert(user.user_id);
                }
                self.users.insert(user.user_id, user.clone());
                entry.insert(user.user_id);

                Ok(UserResolution {
                    user,
                    created: true,
                    linked: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn identity(provider: &str, subject: &str, email: Option<&str>) -> VerifiedIdentity {
        VerifiedIdentity {
            provider_id: provider.to_string(),
            subject: subject.to_string(),
            email: email.map(str::to_string),
            email_verified: email.is_some(),
            name: None,
            raw_claims: json!({}),
        }
    }

    fn session(now: DateTime<Utc>) -> SessionRecord {
        SessionRecord {
            session_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider_id: "google".to_string(),
            subject: "sub".to_string(),
            email: None,
            created_at: now,
            expires_at: now + Duration::hours(1),
            revoked_at: None,
            revoked_reason: None,
        }
    }

    fn token(hash: &str, session_id: Uuid, generation: u32, now: DateTime<Utc>) -> RefreshTokenRecord {
        RefreshTokenRecord {
            token_hash: hash.to_string(),
            session_id,
            generation,
            issued_at: now,
            expires_at: now + Duration::hours(1),
            status: RefreshTokenStatus::Active,
        }
    }

    #[tokio::test]
    async fn test_auth_state_take_is_single_use() {
        let store = InMemoryAuthStateStore::new();
        let now = Utc::now();
        store
            .put(AuthorizationRequestState {
                state: "abc".to_string(),
                provider_id: "google".to_string(),
                nonce: "n".to_string(),
                pkce_verifier: None,
                redirect_to: None,
                created_at: now,
                expires_at: now + Duration::seconds(600),
            })
            .await
            .unwrap();

        assert!(store.take("abc").await.unwrap().is_some());
        assert!(store.take("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_then_replay() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        let record = session(now);
        let sid = record.session_id;
        store
            .create_session(record, token("a", sid, 0, now))
            .await
            .unwrap();

        let outcome = store
            .rotate_refresh_token("a", token("b", Uuid::nil(), 0, now), now)
            .await
            .unwrap();
        assert!(matches!(outcome, RotateOutcome::Rotated { ref previous } if previous.generation == 0));
        assert_eq!(store.active_token_count(sid), 1);
        let next = store.refresh_token("b").unwrap();
        assert_eq!(next.session_id, sid);
        assert_eq!(next.generation, 1);

        let replay = store
            .rotate_refresh_token("a", token("c", sid, 1, now), now)
            .await
            .unwrap();
        assert!(matches!(replay, RotateOutcome::AlreadyRotated(_)));
        assert!(store.refresh_token("c").is_none());
    }

    #[tokio::test]
    async fn test_expired_token_is_not_rotated() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        let record = session(now);
        let sid = record.session_id;
        store
            .create_session(record, token("a", sid, 0, now))
            .await
            .unwrap();

        let later = now + Duration::hours(1);
        let outcome = store
            .rotate_refresh_token("a", token("b", sid, 1, later), later)
            .await
            .unwrap();
        assert!(matches!(outcome, RotateOutcome::Expired(_)));
        assert_eq!(
            store.refresh_token("a").unwrap().status,
            RefreshTokenStatus::Active
        );
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent_and_revokes_tokens() {
        let store = InMemorySessionStore::new();
        let now = Utc::now();
        let record = session(now);
        let sid = record.session_id;
        store
            .create_session(record, token("a", sid, 0, now))
            .await
            .unwrap();

        let first = store.revoke_session(sid, "sign_out", now).await.unwrap().unwrap();
        let second = store
            .revoke_session(sid, "again", now + Duration::seconds(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.revoked_at, second.revoked_at);
        assert_eq!(second.revoked_reason.as_deref(), Some("sign_out"));
        assert_eq!(store.active_token_count(sid), 0);

        assert!(store
            .revoke_session(Uuid::new_v4(), "x", now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_rotation_racing_revocation_leaves_no_active_token() {
        let store = std::sync::Arc::new(InMemorySessionStore::new());
        let now = Utc::now();

        for round in 0..200 {
            let record = session(now);
            let sid = record.session_id;
            let presented = format!("presented-{round}");
            let replacement = format!("replacement-{round}");
            store
                .create_session(record, token(&presented, sid, 0, now))
                .await
                .unwrap();

            let rotating = {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .rotate_refresh_token(&presented, token(&replacement, Uuid::nil(), 0, now), now)
                        .await
                })
            };
            let revoking = {
                let store = store.clone();
                tokio::spawn(async move { store.revoke_session(sid, "refresh_token_reuse", now).await })
            };
            rotating.await.unwrap().unwrap();
            revoking.await.unwrap().unwrap();

            assert_eq!(store.active_token_count(sid), 0, "round {round}");
        }
    }

    #[tokio::test]
    async fn test_same_identity_resolves_to_same_user() {
        let store = InMemoryUserStore::new();
        let first = store
            .resolve_or_create(&identity("google", "1", None), false)
            .await
            .unwrap();
        let second = store
            .resolve_or_create(&identity("google", "1", None), false)
            .await
            .unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.user.user_id, second.user.user_id);
    }

    #[tokio::test]
    async fn test_link_by_verified_email_is_opt_in() {
        let store = InMemoryUserStore::new();
        let google = store
            .resolve_or_create(&identity("google", "1", Some("Ada@Example.com")), true)
            .await
            .unwrap();

        let github_unlinked = store
            .resolve_or_create(&identity("github", "9", Some("ada@example.com")), false)
            .await
            .unwrap();
        assert_ne!(github_unlinked.user.user_id, google.user.user_id);

        let apple_linked = store
            .resolve_or_create(&identity("apple", "7", Some("ada@example.com")), true)
            .await
            .unwrap();
        assert!(apple_linked.linked);
        assert_eq!(apple_linked.user.user_id, google.user.user_id);
        assert_eq!(apple_linked.user.identities.len(), 2);
    }
}
