use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

/// Number of recent attempts kept in memory
pub const RECENT_ATTEMPTS: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failure,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthAttempt {
    pub time: DateTime<Utc>,
    pub provider_id: String,
    pub user_id: Option<Uuid>,
    pub status: AttemptStatus,
    /// Public error code for failures
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthActivitySnapshot {
    pub success: u64,
    pub failure: u64,
    pub recent_attempts: Vec<AuthAttempt>,
}

#[derive(Default)]
struct UserActivity {
    success: u64,
    recent: VecDeque<AuthAttempt>,
}

/// Sign-in counters and a bounded window of recent attempts
///
/// The broker-wide view is for operators. Callers only ever see their own
/// attempts through [`AuthActivityLog::snapshot_for`]; failures that never
/// reached an identity belong to no user.
#[derive(Default)]
pub struct AuthActivityLog {
    success: AtomicU64,
    failure: AtomicU64,
    recent: Mutex<VecDeque<AuthAttempt>>,
    per_user: DashMap<Uuid, UserActivity>,
}

impl AuthActivityLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, provider_id: &str, user_id: Uuid) {
        self.success.fetch_add(1, Ordering::Relaxed);
        let attempt = AuthAttempt {
            time: Utc::now(),
            provider_id: provider_id.to_string(),
            user_id: Some(user_id),
            status: AttemptStatus::Success,
            error: None,
        };

        {
            let mut user = self.per_user.entry(user_id).or_default();
            user.success += 1;
            push_bounded(&mut user.recent, attempt.clone());
        }
        self.push(attempt);
    }

    pub fn record_failure(&self, provider_id: &str, error_code: &str) {
        self.failure.fetch_add(1, Ordering::Relaxed);
        self.push(AuthAttempt {
            time: Utc::now(),
            provider_id: provider_id.to_string(),
            user_id: None,
            status: AttemptStatus::Failure,
            error: Some(error_code.to_string()),
        });
    }

    /// Broker-wide counters and attempts across all users
    #[must_use]
    pub fn snapshot(&self) -> AuthActivitySnapshot {
        AuthActivitySnapshot {
            success: self.success.load(Ordering::Relaxed),
            failure: self.failure.load(Ordering::Relaxed),
            recent_attempts: self.recent().iter().cloned().collect(),
        }
    }

    /// Counters and attempts of a single user
    #[must_use]
    pub fn snapshot_for(&self, user_id: Uuid) -> AuthActivitySnapshot {
        self.per_user.get(&user_id).map_or(
            AuthActivitySnapshot {
                success: 0,
                failure: 0,
                recent_attempts: Vec::new(),
            },
            |user| AuthActivitySnapshot {
                success: user.success,
                failure: 0,
                recent_attempts: user.recent.iter().cloned().collect(),
            },
        )
    }

    fn push(&self, attempt: AuthAttempt) {
        push_bounded(&mut self.recent(), attempt);
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<AuthAttempt>> {
        self.recent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn push_bounded(recent: &mut VecDeque<AuthAttempt>, attempt: AuthAttempt) {
    recent.push_back(attempt);
    while recent.len() > RECENT_ATTEMPTS {
        recent.pop_front();
    }
}
