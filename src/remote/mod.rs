use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::EntityType;
use crate::session::Session;

mod http;
#[cfg(test)]
pub mod memory;

pub use http::HttpRemote;

/// One row as the server sees it. `data` carries the serialized entity and is
/// absent on tombstones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub deleted: bool,
    pub updated_at: String,
}

impl RemoteRecord {
    pub fn tombstone(id: impl Into<String>, updated_at: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            data: None,
            deleted: true,
            updated_at: updated_at.into(),
        }
    }
}

/// Transport to the hosted row store. Implementations never retry; the sync
/// coordinator decides what to do with a failure.
pub trait RemoteStore: Send + Sync {
    fn fetch_since(
        &self,
        session: &Session,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError>;

    fn push(
        &self,
        session: &Session,
        entity: EntityType,
        id: &str,
        data: &Value,
    ) -> Result<RemoteRecord, RemoteError>;

    fn delete(
        &self,
        session: &Session,
        entity: EntityType,
        id: &str,
    ) -> Result<RemoteRecord, RemoteError>;
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unreadable server response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Auth(_))
    }

    /// Failures the next pass may succeed on without anyone intervening.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => true,
            RemoteError::Status { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Auth(_) | RemoteError::Decode(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RemoteError;

    #[test]
    fn classifies_transient_failures() {
        assert!(RemoteError::Network("refused".into()).is_transient());
        assert!(RemoteError::Timeout("10s".into()).is_transient());
        assert!(RemoteError::Status {
            status: 503,
            body: String::new()
        }
        .is_transient());
        assert!(RemoteError::Status {
            status: 429,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Status {
            status: 400,
            body: String::new()
        }
        .is_transient());
        assert!(!RemoteError::Auth("expired".into()).is_transient());
        assert!(RemoteError::Auth("expired".into()).is_auth());
    }
}
