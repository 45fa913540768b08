use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, Transaction};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::db::{self, OutboxEntry};
use crate::domain::{
    parse_day, Completion, EntityType, Habit, HabitDraft, Routine, RoutineDraft,
};
use crate::events::{DomainEvent, EventBus};
use crate::ids::{self, HABIT_PREFIX, ROUTINE_PREFIX};

use super::{
    checked_id, enqueue_delete, enqueue_upsert, normalized_name, HabitStore, SignOutPolicy,
    StoreError,
};

const SANDBOX_ENV: &str = "HABITSYNC_SANDBOX";
const LAST_SYNC_KEY: &str = "last_sync_at";

/// Durable SQLite-backed store. Every mutation commits its rows and the
/// matching outbox entries in one transaction, then publishes events.
pub struct LocalStore {
    conn: Mutex<Connection>,
    path: String,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl LocalStore {
    /// False inside preview sandboxes and wherever SQLite cannot open at all.
    pub fn is_available() -> bool {
        Self::is_available_in(std::env::var(SANDBOX_ENV).ok().as_deref())
    }

    pub(crate) fn is_available_in(sandbox: Option<&str>) -> bool {
        if sandbox.is_some_and(is_truthy) {
            return false;
        }
        db::open_in_memory().is_ok()
    }

    pub fn open(
        path: &str,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Result<Self, StoreError> {
        let init_error = |message: String| StoreError::Init {
            path: path.to_string(),
            message,
        };
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| init_error(err.to_string()))?;
            }
        }
        let conn = db::open_connection(path).map_err(|err| init_error(err.to_string()))?;
        debug!(path, "opened local store");
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_string(),
            clock,
            events,
        })
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>, events: Arc<EventBus>) -> Result<Self, StoreError> {
        let conn = db::open_in_memory().map_err(|err| StoreError::Init {
            path: ":memory:".to_string(),
            message: err.to_string(),
        })?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: ":memory:".to_string(),
            clock,
            events,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn read<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.lock();
        f(&conn)
    }

    /// Runs `f` inside one SQLite transaction; nothing is kept if it fails.
    pub fn write<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_all(&self, events: Vec<DomainEvent>) {
        for event in events {
            self.events.publish(event);
        }
    }

    pub fn get_routine(&self, owner_id: &str, id: &str) -> Result<Option<Routine>, StoreError> {
        self.read(|conn| Ok(db::get_routine(conn, owner_id, id)?))
    }

    pub fn pending_outbox(
        &self,
        owner_id: &str,
        entity: Option<EntityType>,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        self.read(|conn| Ok(db::pending_outbox(conn, owner_id, entity)?))
    }

    pub fn outbox_len(&self, owner_id: &str) -> Result<u64, StoreError> {
        self.read(|conn| Ok(db::outbox_len(conn, owner_id)?))
    }

    pub fn last_sync_at(&self, owner_id: &str) -> Result<Option<String>, StoreError> {
        self.read(|conn| Ok(db::get_meta(conn, &last_sync_key(owner_id))?))
    }

    pub fn record_sync_success(&self, owner_id: &str, at: &str) -> Result<(), StoreError> {
        self.write(|tx| Ok(db::set_meta(tx, &last_sync_key(owner_id), at)?))
    }

    /// Hands rows written while signed out to `owner_id`.
    pub fn adopt_local_rows(&self, owner_id: &str) -> Result<u64, StoreError> {
        if owner_id == crate::session::LOCAL_OWNER {
            return Ok(0);
        }
        let adopted = self.write(|tx| {
            let pending = db::outbox_len(tx, crate::session::LOCAL_OWNER)?;
            let habits = db::list_habits(tx, crate::session::LOCAL_OWNER)?.len() as u64;
            if pending == 0 && habits == 0 {
                return Ok(0);
            }
            db::reassign_owner(tx, crate::session::LOCAL_OWNER, owner_id)?;
            Ok(pending.max(habits))
        })?;
        if adopted > 0 {
            info!(owner = owner_id, adopted, "adopted signed-out rows");
        }
        Ok(adopted)
    }

    pub fn sign_out(&self, owner_id: &str, policy: SignOutPolicy) -> Result<(), StoreError> {
        match policy {
            SignOutPolicy::Retain => {
                let pending = self.outbox_len(owner_id)?;
                info!(owner = owner_id, pending, "signed out; local rows retained");
                Ok(())
            }
            SignOutPolicy::Purge => {
                self.write(|tx| {
                    db::purge_owner(tx, owner_id)?;
                    db::delete_meta(tx, &last_sync_key(owner_id))?;
                    Ok(())
                })?;
                info!(owner = owner_id, "signed out; local rows purged");
                Ok(())
            }
        }
    }
}

impl HabitStore for LocalStore {
    fn is_durable(&self) -> bool {
        true
    }

    fn get_habits(&self, owner_id: &str) -> Result<Vec<Habit>, StoreError> {
        self.read(|conn| Ok(db::list_habits(conn, owner_id)?))
    }

    fn get_habit(&self, owner_id: &str, id: &str) -> Result<Option<Habit>, StoreError> {
        self.read(|conn| Ok(db::get_habit(conn, owner_id, id)?))
    }

    fn get_completions(
        &self,
        date: &str,
        owner_id: &str,
    ) -> Result<BTreeMap<String, bool>, StoreError> {
        let date = parse_day(date)?;
        let rows = self.read(|conn| Ok(db::completions_for_day(conn, owner_id, &date)?))?;
        Ok(rows
            .into_iter()
            .map(|completion| (completion.habit_id, completion.done))
            .collect())
    }

    fn upsert_habit(&self, owner_id: &str, draft: HabitDraft) -> Result<Habit, StoreError> {
        let name = normalized_name(&draft.name, "habit")?;
        if let Some(id) = draft.id.as_deref() {
            checked_id(id)?;
        }
        let now = self.clock.now_rfc3339();

        let (habit, created) = self.write(|tx| {
            let id = match draft.id.clone() {
                Some(id) => id,
                None => ids::generate_id(HABIT_PREFIX, |candidate| {
                    db::get_habit(tx, owner_id, candidate)
                        .ok()
                        .flatten()
                        .is_some()
                }),
            };
            if db::has_tombstone(tx, owner_id, EntityType::Habit, &id)? {
                return Err(StoreError::InvalidArgument(format!(
                    "habit '{id}' was deleted and cannot be reused"
                )));
            }
            let existing = db::get_habit(tx, owner_id, &id)?;
            validate_goal_link(tx, owner_id, &id, &draft, existing.as_ref())?;

            let habit = Habit {
                id: id.clone(),
                name,
                category: draft.category,
                is_goal: draft.is_goal,
                goal_id: draft.goal_id.clone(),
                created_at: existing
                    .as_ref()
                    .map(|h| h.created_at.clone())
                    .unwrap_or_else(|| now.clone()),
                updated_at: now.clone(),
            };
            db::upsert_habit(tx, owner_id, &habit)?;
            enqueue_upsert(tx, owner_id, EntityType::Habit, &habit.id, &habit, &now)?;
            Ok((habit, existing.is_none()))
        })?;

        let event = if created {
            DomainEvent::HabitCreated {
                owner_id: owner_id.to_string(),
                habit_id: habit.id.clone(),
            }
        } else {
            DomainEvent::HabitUpdated {
                owner_id: owner_id.to_string(),
                habit_id: habit.id.clone(),
            }
        };
        self.events.publish(event);
        Ok(habit)
    }

    fn set_completion(
        &self,
        owner_id: &str,
        habit_id: &str,
        date: &str,
        done: bool,
    ) -> Result<Completion, StoreError> {
        let date = parse_day(date)?;
        let now = self.clock.now_rfc3339();

        let (completion, changed) = self.write(|tx| {
            if db::get_habit(tx, owner_id, habit_id)?.is_none() {
                return Err(StoreError::NotFound {
                    entity: EntityType::Habit,
                    id: habit_id.to_string(),
                });
            }
            if let Some(existing) = db::get_completion(tx, owner_id, habit_id, &date)? {
                if existing.done == done {
                    return Ok((existing, false));
                }
            }
            let completion = Completion {
                habit_id: habit_id.to_string(),
                date: date.clone(),
                done,
                updated_at: now.clone(),
            };
            db::upsert_completion(tx, owner_id, &completion)?;
            enqueue_upsert(
                tx,
                owner_id,
                EntityType::Completion,
                &completion.remote_id(),
                &completion,
                &now,
            )?;
            Ok((completion, true))
        })?;

        if changed {
            self.events.publish(DomainEvent::CompletionSet {
                owner_id: owner_id.to_string(),
                habit_id: habit_id.to_string(),
                date,
                done,
            });
        }
        Ok(completion)
    }

    fn delete_habit(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_rfc3339();
        let events = self.write(|tx| {
            if db::get_habit(tx, owner_id, id)?.is_none() {
                return Ok(None);
            }
            let mut events = Vec::new();

            for mut child in db::list_goal_children(tx, owner_id, id)? {
                child.goal_id = None;
                child.updated_at = now.clone();
                db::upsert_habit(tx, owner_id, &child)?;
                enqueue_upsert(tx, owner_id, EntityType::Habit, &child.id, &child, &now)?;
                events.push(DomainEvent::HabitUpdated {
                    owner_id: owner_id.to_string(),
                    habit_id: child.id,
                });
            }

            for completion in db::completions_for_habit(tx, owner_id, id)? {
                db::delete_completion(tx, owner_id, id, &completion.date)?;
                let key = completion.remote_id();
                db::record_tombstone(tx, owner_id, EntityType::Completion, &key, &now)?;
                enqueue_delete(tx, owner_id, EntityType::Completion, &key, &now)?;
            }

            for mut routine in db::list_routines(tx, owner_id)? {
                if !routine.references(id) {
                    continue;
                }
                routine.steps.retain(|step| step.habit_id != id);
                routine.updated_at = now.clone();
                db::upsert_routine(tx, owner_id, &routine)?;
                enqueue_upsert(tx, owner_id, EntityType::Routine, &routine.id, &routine, &now)?;
                events.push(DomainEvent::RoutineSaved {
                    owner_id: owner_id.to_string(),
                    routine_id: routine.id,
                });
            }

            db::delete_habit(tx, owner_id, id)?;
            db::record_tombstone(tx, owner_id, EntityType::Habit, id, &now)?;
            enqueue_delete(tx, owner_id, EntityType::Habit, id, &now)?;
            events.push(DomainEvent::HabitDeleted {
                owner_id: owner_id.to_string(),
                habit_id: id.to_string(),
            });
            Ok(Some(events))
        })?;

        match events {
            Some(events) => {
                self.publish_all(events);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn list_routines(&self, owner_id: &str) -> Result<Vec<Routine>, StoreError> {
        self.read(|conn| Ok(db::list_routines(conn, owner_id)?))
    }

    fn save_routine(&self, owner_id: &str, draft: RoutineDraft) -> Result<Routine, StoreError> {
        let name = normalized_name(&draft.name, "routine")?;
        if let Some(id) = draft.id.as_deref() {
            checked_id(id)?;
        }
        let now = self.clock.now_rfc3339();

        let routine = self.write(|tx| {
            for step in &draft.steps {
                if db::get_habit(tx, owner_id, &step.habit_id)?.is_none() {
                    return Err(StoreError::NotFound {
                        entity: EntityType::Habit,
                        id: step.habit_id.clone(),
                    });
                }
            }
            let id = match draft.id.clone() {
                Some(id) => id,
                None => ids::generate_id(ROUTINE_PREFIX, |candidate| {
                    db::get_routine(tx, owner_id, candidate)
                        .ok()
                        .flatten()
                        .is_some()
                }),
            };
            if db::has_tombstone(tx, owner_id, EntityType::Routine, &id)? {
                return Err(StoreError::InvalidArgument(format!(
                    "routine '{id}' was deleted and cannot be reused"
                )));
            }
            let existing = db::get_routine(tx, owner_id, &id)?;
            let routine = Routine {
                id,
                name,
                steps: draft.steps.clone(),
                created_at: existing
                    .map(|r| r.created_at)
                    .unwrap_or_else(|| now.clone()),
                updated_at: now.clone(),
            };
            db::upsert_routine(tx, owner_id, &routine)?;
            enqueue_upsert(tx, owner_id, EntityType::Routine, &routine.id, &routine, &now)?;
            Ok(routine)
        })?;

        self.events.publish(DomainEvent::RoutineSaved {
            owner_id: owner_id.to_string(),
            routine_id: routine.id.clone(),
        });
        Ok(routine)
    }

    fn delete_routine(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_rfc3339();
        let deleted = self.write(|tx| {
            if !db::delete_routine(tx, owner_id, id)? {
                return Ok(false);
            }
            db::record_tombstone(tx, owner_id, EntityType::Routine, id, &now)?;
            enqueue_delete(tx, owner_id, EntityType::Routine, id, &now)?;
            Ok(true)
        })?;
        if deleted {
            self.events.publish(DomainEvent::RoutineDeleted {
                owner_id: owner_id.to_string(),
                routine_id: id.to_string(),
            });
        }
        Ok(deleted)
    }
}

fn validate_goal_link(
    conn: &Connection,
    owner_id: &str,
    id: &str,
    draft: &HabitDraft,
    existing: Option<&Habit>,
) -> Result<(), StoreError> {
    if let Some(goal_id) = draft.goal_id.as_deref() {
        if goal_id == id {
            return Err(StoreError::InvalidGoal(format!(
                "habit '{id}' cannot be its own goal"
            )));
        }
        match db::get_habit(conn, owner_id, goal_id)? {
            Some(goal) if goal.is_goal => {}
            Some(_) => {
                return Err(StoreError::InvalidGoal(format!(
                    "habit '{goal_id}' is not a goal"
                )))
            }
            None => {
                return Err(StoreError::InvalidGoal(format!(
                    "goal '{goal_id}' does not exist"
                )))
            }
        }
    }

    let demoting = existing.is_some_and(|habit| habit.is_goal) && !draft.is_goal;
    if demoting && !db::list_goal_children(conn, owner_id, id)?.is_empty() {
        return Err(StoreError::InvalidGoal(format!(
            "goal '{id}' still has habits linked to it"
        )));
    }
    Ok(())
}

fn last_sync_key(owner_id: &str) -> String {
    format!("{LAST_SYNC_KEY}:{owner_id}")
}

fn is_truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
