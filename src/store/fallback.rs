use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::domain::{
    parse_day, Completion, EntityType, Habit, HabitDraft, Routine, RoutineDraft,
};
use crate::events::{DomainEvent, EventBus};
use crate::ids::{self, HABIT_PREFIX, ROUTINE_PREFIX};
use crate::remote::{RemoteRecord, RemoteStore};
use crate::session::{Session, SessionProvider};

use super::{checked_id, normalized_name, HabitStore, StoreError};

type OwnedKey = (String, String);
type CompletionKey = (String, String, String);
type DeletedKey = (String, EntityType, String);

#[derive(Debug, Default)]
struct Cache {
    habits: BTreeMap<OwnedKey, Habit>,
    completions: BTreeMap<CompletionKey, Completion>,
    routines: BTreeMap<OwnedKey, Routine>,
    /// Ids deleted in this process. Remote reads never bring them back, even
    /// when the remote delete failed.
    deleted: BTreeSet<DeletedKey>,
}

impl Cache {
    fn forget(&mut self, owner_id: &str, entity: EntityType, id: &str) {
        self.deleted
            .insert((owner_id.to_string(), entity, id.to_string()));
    }

    fn is_deleted(&self, owner_id: &str, entity: EntityType, id: &str) -> bool {
        self.deleted
            .contains(&(owner_id.to_string(), entity, id.to_string()))
    }
}

/// Remote-only store used when the embedded database is unusable. Rows live in
/// memory for the life of the process. With a session and a remote, reads
/// refresh from the server and writes go straight to it; a failed remote call
/// is logged and the cached value is served instead.
pub struct VolatileStore {
    cache: Mutex<Cache>,
    remote: Option<Arc<dyn RemoteStore>>,
    sessions: Arc<dyn SessionProvider>,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
}

impl VolatileStore {
    pub fn new(
        remote: Option<Arc<dyn RemoteStore>>,
        sessions: Arc<dyn SessionProvider>,
        clock: Arc<dyn Clock>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            cache: Mutex::new(Cache::default()),
            remote,
            sessions,
            clock,
            events,
        }
    }

    pub fn get_routine(&self, owner_id: &str, id: &str) -> Option<Routine> {
        self.refresh(owner_id, EntityType::Routine);
        self.lock()
            .routines
            .get(&(owner_id.to_string(), id.to_string()))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session and remote to talk to, if the owner is the one signed in.
    fn online(&self, owner_id: &str) -> Option<(Session, &dyn RemoteStore)> {
        let remote = self.remote.as_deref()?;
        let session = self.sessions.current()?;
        (session.owner_id == owner_id).then_some((session, remote))
    }

    fn refresh(&self, owner_id: &str, entity: EntityType) {
        let Some((session, remote)) = self.online(owner_id) else {
            return;
        };
        let records = match remote.fetch_since(&session, entity, None) {
            Ok(records) => records,
            Err(err) => {
                warn!(owner = owner_id, %entity, error = %err, "remote read failed; serving cached rows");
                return;
            }
        };

        let mut cache = self.lock();
        for record in records {
            apply_record(&mut cache, owner_id, entity, record);
        }
    }

    fn push<T: Serialize>(&self, owner_id: &str, entity: EntityType, id: &str, value: &T) {
        let Some((session, remote)) = self.online(owner_id) else {
            return;
        };
        let payload = match serde_json::to_value(value) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%entity, id, error = %err, "could not encode row for remote write");
                return;
            }
        };
        match remote.push(&session, entity, id, &payload) {
            Ok(record) => {
                let mut cache = self.lock();
                apply_record(&mut cache, owner_id, entity, record);
            }
            Err(err) => warn!(%entity, id, error = %err, "remote write failed; change kept in memory only"),
        }
    }

    fn push_delete(&self, owner_id: &str, entity: EntityType, id: &str) {
        let Some((session, remote)) = self.online(owner_id) else {
            return;
        };
        if let Err(err) = remote.delete(&session, entity, id) {
            warn!(%entity, id, error = %err, "remote delete failed; change kept in memory only");
        }
    }
}

fn apply_record(cache: &mut Cache, owner_id: &str, entity: EntityType, record: RemoteRecord) {
    if cache.is_deleted(owner_id, entity, &record.id) {
        debug!(%entity, id = %record.id, "ignoring remote row deleted here");
        return;
    }
    let owner = owner_id.to_string();
    match entity {
        EntityType::Habit => {
            let key = (owner, record.id.clone());
            match decode::<Habit>(&record) {
                Some(mut habit) => {
                    habit.updated_at = record.updated_at;
                    cache.habits.insert(key, habit);
                }
                None => {
                    cache.habits.remove(&key);
                }
            }
        }
        EntityType::Completion => {
            let Some((habit_id, date)) = record.id.split_once('@') else {
                debug!(id = %record.id, "skipping completion with malformed id");
                return;
            };
            let key = (owner, habit_id.to_string(), date.to_string());
            match decode::<Completion>(&record) {
                Some(mut completion) => {
                    completion.updated_at = record.updated_at;
                    cache.completions.insert(key, completion);
                }
                None => {
                    cache.completions.remove(&key);
                }
            }
        }
        EntityType::Routine => {
            let key = (owner, record.id.clone());
            match decode::<Routine>(&record) {
                Some(mut routine) => {
                    routine.updated_at = record.updated_at;
                    cache.routines.insert(key, routine);
                }
                None => {
                    cache.routines.remove(&key);
                }
            }
        }
    }
}

/// `None` for tombstones and for payloads this build cannot read.
fn decode<T: DeserializeOwned>(record: &RemoteRecord) -> Option<T> {
    if record.deleted {
        return None;
    }
    let data = record.data.clone()?;
    match serde_json::from_value(data) {
        Ok(value) => Some(value),
        Err(err) => {
            debug!(id = %record.id, error = %err, "skipping undecodable remote row");
            None
        }
    }
}

impl HabitStore for VolatileStore {
    fn is_durable(&self) -> bool {
        false
    }

    fn get_habits(&self, owner_id: &str) -> Result<Vec<Habit>, StoreError> {
        self.refresh(owner_id, EntityType::Habit);
        let cache = self.lock();
        let mut habits: Vec<Habit> = cache
            .habits
            .iter()
            .filter(|((owner, _), _)| owner == owner_id)
            .map(|(_, habit)| habit.clone())
            .collect();
        habits.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(habits)
    }

    fn get_habit(&self, owner_id: &str, id: &str) -> Result<Option<Habit>, StoreError> {
        let key = (owner_id.to_string(), id.to_string());
        if let Some(habit) = self.lock().habits.get(&key) {
            return Ok(Some(habit.clone()));
        }
        self.refresh(owner_id, EntityType::Habit);
        Ok(self.lock().habits.get(&key).cloned())
    }

    fn get_completions(
        &self,
        date: &str,
        owner_id: &str,
    ) -> Result<BTreeMap<String, bool>, StoreError> {
        let date = parse_day(date)?;
        self.refresh(owner_id, EntityType::Completion);
        let cache = self.lock();
        Ok(cache
            .completions
            .iter()
            .filter(|((owner, _, day), _)| owner == owner_id && *day == date)
            .map(|((_, habit_id, _), completion)| (habit_id.clone(), completion.done))
            .collect())
    }

    fn upsert_habit(&self, owner_id: &str, draft: HabitDraft) -> Result<Habit, StoreError> {
        let name = normalized_name(&draft.name, "habit")?;
        if let Some(id) = draft.id.as_deref() {
            checked_id(id)?;
        }
        let now = self.clock.now_rfc3339();

        let (habit, created) = {
            let mut cache = self.lock();
            let id = draft.id.clone().unwrap_or_else(|| {
                ids::generate_id(HABIT_PREFIX, |candidate| {
                    cache
                        .habits
                        .contains_key(&(owner_id.to_string(), candidate.to_string()))
                })
            });
            if cache.is_deleted(owner_id, EntityType::Habit, &id) {
                return Err(StoreError::InvalidArgument(format!(
                    "habit '{id}' was deleted and cannot be reused"
                )));
            }
            if let Some(goal_id) = draft.goal_id.as_deref() {
                let is_goal = cache
                    .habits
                    .get(&(owner_id.to_string(), goal_id.to_string()))
                    .is_some_and(|goal| goal.is_goal);
                if goal_id == id || !is_goal {
                    return Err(StoreError::InvalidGoal(format!(
                        "'{goal_id}' is not a goal of this owner"
                    )));
                }
            }
            let key = (owner_id.to_string(), id.clone());
            let existing = cache.habits.get(&key).cloned();
            let habit = Habit {
                id,
                name,
                category: draft.category,
                is_goal: draft.is_goal,
                goal_id: draft.goal_id,
                created_at: existing
                    .as_ref()
                    .map(|h| h.created_at.clone())
                    .unwrap_or_else(|| now.clone()),
                updated_at: now,
            };
            cache.habits.insert(key, habit.clone());
            (habit, existing.is_none())
        };

        self.push(owner_id, EntityType::Habit, &habit.id, &habit);
        let habit_id = habit.id.clone();
        self.events.publish(if created {
            DomainEvent::HabitCreated {
                owner_id: owner_id.to_string(),
                habit_id,
            }
        } else {
            DomainEvent::HabitUpdated {
                owner_id: owner_id.to_string(),
                habit_id,
            }
        });
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
        self.get_habit(owner_id, habit_id)?;
        let completion = {
            let mut cache = self.lock();
            if !cache
                .habits
                .contains_key(&(owner_id.to_string(), habit_id.to_string()))
            {
                return Err(StoreError::NotFound {
                    entity: EntityType::Habit,
                    id: habit_id.to_string(),
                });
            }
            let completion = Completion {
                habit_id: habit_id.to_string(),
                date: date.clone(),
                done,
                updated_at: self.clock.now_rfc3339(),
            };
            cache.completions.insert(
                (owner_id.to_string(), habit_id.to_string(), date.clone()),
                completion.clone(),
            );
            completion
        };

        self.push(owner_id, EntityType::Completion, &completion.remote_id(), &completion);
        self.events.publish(DomainEvent::CompletionSet {
            owner_id: owner_id.to_string(),
            habit_id: habit_id.to_string(),
            date,
            done,
        });
        Ok(completion)
    }

    fn delete_habit(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        let now = self.clock.now_rfc3339();
        let (removed, children, routines) = {
            let mut cache = self.lock();
            let key = (owner_id.to_string(), id.to_string());
            if cache.habits.remove(&key).is_none() {
                return Ok(false);
            }
            cache.forget(owner_id, EntityType::Habit, id);
            let mut removed = Vec::new();
            cache.completions.retain(|(owner, habit_id, _), completion| {
                let gone = owner == owner_id && habit_id == id;
                if gone {
                    removed.push(completion.remote_id());
                }
                !gone
            });
            for completion_id in &removed {
                cache.forget(owner_id, EntityType::Completion, completion_id);
            }
            let mut children = Vec::new();
            for ((owner, _), habit) in cache.habits.iter_mut() {
                if owner == owner_id && habit.goal_id.as_deref() == Some(id) {
                    habit.goal_id = None;
                    habit.updated_at = now.clone();
                    children.push(habit.clone());
                }
            }
            let mut routines = Vec::new();
            for ((owner, _), routine) in cache.routines.iter_mut() {
                if owner == owner_id && routine.references(id) {
                    routine.steps.retain(|step| step.habit_id != id);
                    routine.updated_at = now.clone();
                    routines.push(routine.clone());
                }
            }
            (removed, children, routines)
        };

        for child in &children {
            self.push(owner_id, EntityType::Habit, &child.id, child);
        }
        for completion_id in removed {
            self.push_delete(owner_id, EntityType::Completion, &completion_id);
        }
        for routine in &routines {
            self.push(owner_id, EntityType::Routine, &routine.id, routine);
        }
        self.push_delete(owner_id, EntityType::Habit, id);
        self.events.publish(DomainEvent::HabitDeleted {
            owner_id: owner_id.to_string(),
            habit_id: id.to_string(),
        });
        Ok(true)
    }

    fn list_routines(&self, owner_id: &str) -> Result<Vec<Routine>, StoreError> {
        self.refresh(owner_id, EntityType::Routine);
        let cache = self.lock();
        Ok(cache
            .routines
            .iter()
            .filter(|((owner, _), _)| owner == owner_id)
            .map(|(_, routine)| routine.clone())
            .collect())
    }

    fn save_routine(&self, owner_id: &str, draft: RoutineDraft) -> Result<Routine, StoreError> {
        let name = normalized_name(&draft.name, "routine")?;
        if let Some(id) = draft.id.as_deref() {
            checked_id(id)?;
        }
        let now = self.clock.now_rfc3339();

        let routine = {
            let mut cache = self.lock();
            if let Some(step) = draft.steps.iter().find(|step| {
                !cache
                    .habits
                    .contains_key(&(owner_id.to_string(), step.habit_id.clone()))
            }) {
                return Err(StoreError::NotFound {
                    entity: EntityType::Habit,
                    id: step.habit_id.clone(),
                });
            }
            let id = draft.id.clone().unwrap_or_else(|| {
                ids::generate_id(ROUTINE_PREFIX, |candidate| {
                    cache
                        .routines
                        .contains_key(&(owner_id.to_string(), candidate.to_string()))
                })
            });
            if cache.is_deleted(owner_id, EntityType::Routine, &id) {
                return Err(StoreError::InvalidArgument(format!(
                    "routine '{id}' was deleted and cannot be reused"
                )));
            }
            let key = (owner_id.to_string(), id.clone());
            let created_at = cache
                .routines
                .get(&key)
                .map(|r| r.created_at.clone())
                .unwrap_or_else(|| now.clone());
            let routine = Routine {
                id,
                name,
                steps: draft.steps,
                created_at,
                updated_at: now,
            };
            cache.routines.insert(key, routine.clone());
            routine
        };

        self.push(owner_id, EntityType::Routine, &routine.id, &routine);
        self.events.publish(DomainEvent::RoutineSaved {
            owner_id: owner_id.to_string(),
            routine_id: routine.id.clone(),
        });
        Ok(routine)
    }

    fn delete_routine(&self, owner_id: &str, id: &str) -> Result<bool, StoreError> {
        {
            let mut cache = self.lock();
            if cache
                .routines
                .remove(&(owner_id.to_string(), id.to_string()))
                .is_none()
            {
                return Ok(false);
            }
            cache.forget(owner_id, EntityType::Routine, id);
        }
        self.push_delete(owner_id, EntityType::Routine, id);
        self.events.publish(DomainEvent::RoutineDeleted {
            owner_id: owner_id.to_string(),
            routine_id: id.to_string(),
        });
        Ok(true)
    }
}
