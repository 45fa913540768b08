use std::sync::Mutex;

use time::OffsetDateTime;

use crate::clock::parse_rfc3339;

/// Owner id used for rows written while nobody is signed in. They are adopted
/// by the first account that signs in on this device.
pub const LOCAL_OWNER: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub owner_id: String,
    pub access_token: String,
    pub expires_at: Option<String>,
}

impl Session {
    pub fn new(owner_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            access_token: access_token.into(),
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: impl Into<String>) -> Self {
        self.expires_at = Some(expires_at.into());
        self
    }

    /// Only a parseable expiry in the past counts; an unknown expiry is left
    /// for the server to judge.
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at
            .as_deref()
            .and_then(parse_rfc3339)
            .is_some_and(|expires_at| expires_at <= now)
    }
}

pub trait SessionProvider: Send + Sync {
    fn current(&self) -> Option<Session>;
}

#[derive(Debug, Default)]
pub struct SessionState {
    current: Mutex<Option<Session>>,
}

impl SessionState {
    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn signed_in(session: Session) -> Self {
        Self {
            current: Mutex::new(Some(session)),
        }
    }

    pub fn sign_in(&self, session: Session) {
        *self.lock() = Some(session);
    }

    pub fn sign_out(&self) -> Option<Session> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl SessionProvider for SessionState {
    fn current(&self) -> Option<Session> {
        self.lock().clone()
    }
}

/// Owner id that local reads and writes should use right now.
pub fn active_owner(provider: &dyn SessionProvider) -> String {
    provider
        .current()
        .map(|session| session.owner_id)
        .unwrap_or_else(|| LOCAL_OWNER.to_string())
}
