use std::collections::BTreeMap;

use rusqlite::Connection;
use thiserror::Error;

use crate::db::{self, NewOutboxEntry};
use crate::domain::{
    Completion, EntityType, Habit, HabitDraft, InvalidDay, OutboxOp, Routine, RoutineDraft,
};

mod fallback;
mod local;

pub use fallback::VolatileStore;
pub use local::LocalStore;

/// The read/write surface screens and commands use. Implemented by the durable
/// SQLite store and by the volatile store used when SQLite is unusable.
pub trait HabitStore: Send + Sync {
    fn is_durable(&self) -> bool;

    fn get_habits(&self, owner_id: &str) -> Result<Vec<Habit>, StoreError>;

    fn get_habit(&self, owner_id: &str, id: &str) -> Result<Option<Habit>, StoreError>;

    fn get_completions(
        &self,
        date: &str,
        owner_id: &str,
    ) -> Result<BTreeMap<String, bool>, StoreError>;

    fn upsert_habit(&self, owner_id: &str, draft: HabitDraft) -> Result<Habit, StoreError>;

    fn set_completion(
        &self,
        owner_id: &str,
        habit_id: &str,
        date: &str,
        done: bool,
    ) -> Result<Completion, StoreError>;

    fn delete_habit(&self, owner_id: &str, id: &str) -> Result<bool, StoreError>;

    fn list_routines(&self, owner_id: &str) -> Result<Vec<Routine>, StoreError>;

    fn save_routine(&self, owner_id: &str, draft: RoutineDraft) -> Result<Routine, StoreError>;

    fn delete_routine(&self, owner_id: &str, id: &str) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignOutPolicy {
    /// Keep rows and pending changes; they sync on the owner's next sign-in.
    #[default]
    Retain,
    /// Drop everything stored for the owner, including unsynced changes.
    Purge,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local store unavailable at '{path}': {message}")]
    Init { path: String, message: String },
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{entity} '{id}' not found")]
    NotFound { entity: EntityType, id: String },
    #[error("invalid goal link: {0}")]
    InvalidGoal(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error(transparent)]
    InvalidDay(#[from] InvalidDay),
}

impl StoreError {
    pub fn is_init(&self) -> bool {
        matches!(self, StoreError::Init { .. })
    }
}

fn normalized_name(raw: &str, what: &str) -> Result<String, StoreError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StoreError::InvalidArgument(format!("{what} name cannot be empty")));
    }
    Ok(trimmed.to_string())
}

fn checked_id(id: &str) -> Result<(), StoreError> {
    if crate::ids::is_valid_id(id) {
        Ok(())
    } else {
        Err(StoreError::InvalidArgument(format!("invalid id '{id}'")))
    }
}

pub(crate) fn enqueue_upsert<T: serde::Serialize>(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    value: &T,
    at: &str,
) -> Result<(), StoreError> {
    let payload = serde_json::to_string(value)?;
    db::enqueue_outbox(
        conn,
        &NewOutboxEntry {
            owner_id,
            entity_type,
            entity_id,
            op: OutboxOp::Upsert,
            payload: Some(&payload),
            enqueued_at: at,
        },
    )?;
    Ok(())
}

pub(crate) fn enqueue_delete(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    at: &str,
) -> Result<(), StoreError> {
    db::enqueue_outbox(
        conn,
        &NewOutboxEntry {
            owner_id,
            entity_type,
            entity_id,
            op: OutboxOp::Delete,
            payload: None,
            enqueued_at: at,
        },
    )?;
    Ok(())
}
