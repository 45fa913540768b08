use std::cmp::Ordering;

use rusqlite::Connection;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::clock::compare_timestamps;
use crate::db::{self, OutboxEntry};
use crate::domain::{Completion, EntityType, Habit, OutboxOp, Routine};
use crate::remote::RemoteRecord;
use crate::store::{enqueue_upsert, StoreError};

/// What happened to one pulled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullDecision {
    Applied,
    Deleted,
    /// Local pending edits are newer; they win and get pushed later.
    KeptLocal,
    /// A local delete or tombstone already settled this id.
    Ignored,
    /// A completion whose habit has not arrived yet. The cursor stays behind
    /// it so the next pass fetches it again.
    Waiting,
    /// Unreadable payload.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullOutcome {
    pub decision: PullDecision,
    pub discarded: u64,
}

impl PullOutcome {
    fn new(decision: PullDecision) -> Self {
        Self {
            decision,
            discarded: 0,
        }
    }
}

/// Writes remote state into the local tables for one owner. Callers run it
/// inside the store's write transaction.
pub struct RecordApplier<'a> {
    conn: &'a Connection,
    owner_id: &'a str,
}

impl<'a> RecordApplier<'a> {
    pub fn new(conn: &'a Connection, owner_id: &'a str) -> Self {
        Self { conn, owner_id }
    }

    pub fn apply_pulled(
        &self,
        entity: EntityType,
        record: &RemoteRecord,
    ) -> Result<PullOutcome, StoreError> {
        let pending = db::pending_for_entity(self.conn, self.owner_id, entity, &record.id)?;

        if record.deleted {
            self.delete_row(entity, &record.id, &record.updated_at)?;
            db::record_tombstone(self.conn, self.owner_id, entity, &record.id, &record.updated_at)?;
            let discarded = db::remove_outbox_for_entity(self.conn, self.owner_id, entity, &record.id)?;
            if discarded > 0 {
                info!(
                    %entity,
                    id = %record.id,
                    discarded,
                    "remote delete discarded pending local changes"
                );
            }
            return Ok(PullOutcome {
                decision: PullDecision::Deleted,
                discarded: discarded as u64,
            });
        }

        let locally_deleted = pending.iter().any(|entry| entry.op == OutboxOp::Delete)
            || db::has_tombstone(self.conn, self.owner_id, entity, &record.id)?;
        if locally_deleted {
            debug!(%entity, id = %record.id, "ignoring remote update for deleted row");
            return Ok(PullOutcome::new(PullDecision::Ignored));
        }

        let mut discarded = 0;
        if let Some(local_newest) = newest_enqueued(&pending) {
            if compare_timestamps(&record.updated_at, local_newest) == Ordering::Less {
                debug!(
                    %entity,
                    id = %record.id,
                    remote = %record.updated_at,
                    local = local_newest,
                    "keeping newer local change"
                );
                return Ok(PullOutcome::new(PullDecision::KeptLocal));
            }
            discarded = db::remove_outbox_for_entity(self.conn, self.owner_id, entity, &record.id)?
                as u64;
            info!(
                %entity,
                id = %record.id,
                remote = %record.updated_at,
                local = local_newest,
                discarded,
                "conflict: remote change is newer, local changes discarded"
            );
        }

        let decision = self.write_row(entity, record)?;
        Ok(PullOutcome {
            decision,
            discarded,
        })
    }

    /// Settles a pushed outbox entry against the server's answer. Returns true
    /// when the server answered with a tombstone.
    pub fn confirm_push(
        &self,
        entry: &OutboxEntry,
        record: &RemoteRecord,
    ) -> Result<bool, StoreError> {
        db::remove_outbox(self.conn, entry.seq)?;
        let entity = entry.entity_type;
        let id = entry.entity_id.as_str();

        if record.deleted {
            self.delete_row(entity, id, &record.updated_at)?;
            db::record_tombstone(self.conn, self.owner_id, entity, id, &record.updated_at)?;
            let dropped = db::remove_outbox_for_entity(self.conn, self.owner_id, entity, id)?;
            if entry.op == OutboxOp::Upsert {
                info!(%entity, id, dropped, "server holds a tombstone; local row removed");
            }
            return Ok(true);
        }

        // A later edit still queued keeps its own, newer local stamp.
        if db::pending_for_entity(self.conn, self.owner_id, entity, id)?.is_empty() {
            db::set_updated_at(self.conn, self.owner_id, entity, id, &record.updated_at)?;
        }
        Ok(false)
    }

    /// Removes a row the server reports deleted. A deleted habit takes its
    /// completions with it; its goal children and routine steps are detached
    /// and queued for push, stamped with the tombstone's time.
    fn delete_row(&self, entity: EntityType, id: &str, at: &str) -> Result<(), StoreError> {
        match entity {
            EntityType::Habit => {
                for mut child in db::list_goal_children(self.conn, self.owner_id, id)? {
                    child.goal_id = None;
                    child.updated_at = at.to_string();
                    db::upsert_habit(self.conn, self.owner_id, &child)?;
                    enqueue_upsert(
                        self.conn,
                        self.owner_id,
                        EntityType::Habit,
                        &child.id,
                        &child,
                        at,
                    )?;
                }
                for mut routine in db::list_routines(self.conn, self.owner_id)? {
                    if !routine.references(id) {
                        continue;
                    }
                    routine.steps.retain(|step| step.habit_id != id);
                    routine.updated_at = at.to_string();
                    db::upsert_routine(self.conn, self.owner_id, &routine)?;
                    enqueue_upsert(
                        self.conn,
                        self.owner_id,
                        EntityType::Routine,
                        &routine.id,
                        &routine,
                        at,
                    )?;
                }
                for completion in db::completions_for_habit(self.conn, self.owner_id, id)? {
                    db::delete_completion(self.conn, self.owner_id, id, &completion.date)?;
                    db::remove_outbox_for_entity(
                        self.conn,
                        self.owner_id,
                        EntityType::Completion,
                        &completion.remote_id(),
                    )?;
                }
                db::delete_habit(self.conn, self.owner_id, id)?;
            }
            EntityType::Completion => {
                if let Some((habit_id, date)) = id.split_once('@') {
                    db::delete_completion(self.conn, self.owner_id, habit_id, date)?;
                }
            }
            EntityType::Routine => {
                db::delete_routine(self.conn, self.owner_id, id)?;
            }
        }
        Ok(())
    }

    fn write_row(
        &self,
        entity: EntityType,
        record: &RemoteRecord,
    ) -> Result<PullDecision, StoreError> {
        match entity {
            EntityType::Habit => {
                let Some(mut habit) = decode::<Habit>(entity, record) else {
                    return Ok(PullDecision::Skipped);
                };
                habit.id = record.id.clone();
                habit.updated_at = record.updated_at.clone();
                db::upsert_habit(self.conn, self.owner_id, &habit)?;
            }
            EntityType::Completion => {
                let Some(mut completion) = decode::<Completion>(entity, record) else {
                    return Ok(PullDecision::Skipped);
                };
                if completion.remote_id() != record.id {
                    warn!(id = %record.id, "completion payload does not match its id");
                    return Ok(PullDecision::Skipped);
                }
                let habit_id = completion.habit_id.as_str();
                if db::get_habit(self.conn, self.owner_id, habit_id)?.is_none() {
                    if db::has_tombstone(self.conn, self.owner_id, EntityType::Habit, habit_id)? {
                        debug!(id = %record.id, "ignoring completion for deleted habit");
                        return Ok(PullDecision::Ignored);
                    }
                    debug!(id = %record.id, "completion waits for its habit");
                    return Ok(PullDecision::Waiting);
                }
                completion.updated_at = record.updated_at.clone();
                db::upsert_completion(self.conn, self.owner_id, &completion)?;
            }
            EntityType::Routine => {
                let Some(mut routine) = decode::<Routine>(entity, record) else {
                    return Ok(PullDecision::Skipped);
                };
                routine.id = record.id.clone();
                routine.updated_at = record.updated_at.clone();
                db::upsert_routine(self.conn, self.owner_id, &routine)?;
            }
        }
        Ok(PullDecision::Applied)
    }
}

fn newest_enqueued(pending: &[OutboxEntry]) -> Option<&str> {
    pending
        .iter()
        .map(|entry| entry.enqueued_at.as_str())
        .max_by(|left, right| compare_timestamps(left, right))
}

fn decode<T: DeserializeOwned>(entity: EntityType, record: &RemoteRecord) -> Option<T> {
    let Some(data) = record.data.clone() else {
        warn!(%entity, id = %record.id, "remote row has no data");
        return None;
    };
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(%entity, id = %record.id, error = %err, "skipping unreadable remote row");
            None
        }
    }
}
