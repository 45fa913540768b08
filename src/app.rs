use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::capabilities::Capabilities;
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, ConfigError};
use crate::db::OutboxEntry;
use crate::domain::{
    day_of, Category, Completion, Habit, HabitDraft, Routine, RoutineDraft,
};
use crate::events::{DomainEvent, EventBus};
use crate::remote::{HttpRemote, RemoteError, RemoteStore};
use crate::session::{active_owner, Session, SessionProvider, SessionState};
use crate::store::{HabitStore, LocalStore, SignOutPolicy, StoreError, VolatileStore};
use crate::sync::{PassOutcome, SyncCoordinator, SyncError, SyncPhase, SyncService};

/// Wires the store, remote client and coordinator together for one process.
pub struct App {
    config: Config,
    capabilities: Capabilities,
    clock: Arc<dyn Clock>,
    events: Arc<EventBus>,
    sessions: Arc<SessionState>,
    store: Arc<dyn HabitStore>,
    local: Option<Arc<LocalStore>>,
    coordinator: Option<Arc<SyncCoordinator>>,
    service: Option<SyncService>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenOptions {
    /// Run one blocking full sync when a session is present.
    pub initial_sync: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AppStatus {
    pub owner_id: String,
    pub signed_in: bool,
    pub mode: &'static str,
    pub durable: bool,
    pub db_path: Option<String>,
    pub remote_url: Option<String>,
    pub phase: SyncPhase,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub pending: u64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DayEntry {
    pub habit_id: String,
    pub name: String,
    pub category: Category,
    pub done: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HabitPatch {
    pub name: Option<String>,
    pub category: Option<Category>,
    pub is_goal: Option<bool>,
    pub goal_id: Option<Option<String>>,
}

impl HabitPatch {
    fn has_changes(&self) -> bool {
        self.name.is_some()
            || self.category.is_some()
            || self.is_goal.is_some()
            || self.goal_id.is_some()
    }
}

impl App {
    pub fn open(
        config: Config,
        session: Option<Session>,
        options: OpenOptions,
    ) -> Result<Self, AppError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let capabilities = Capabilities::detect(&config);
        let remote = match &config.remote {
            Some(remote) => {
                let client = HttpRemote::new(
                    &remote.url,
                    remote.api_key.clone(),
                    remote.timeout,
                    Arc::clone(&clock),
                )?;
                Some(Arc::new(client) as Arc<dyn RemoteStore>)
            }
            None => None,
        };
        Self::assemble(config, capabilities, remote, session, clock, options)
    }

    pub(crate) fn assemble(
        config: Config,
        mut capabilities: Capabilities,
        remote: Option<Arc<dyn RemoteStore>>,
        session: Option<Session>,
        clock: Arc<dyn Clock>,
        options: OpenOptions,
    ) -> Result<Self, AppError> {
        let events = Arc::new(EventBus::new());
        let sessions = Arc::new(match session {
            Some(session) => SessionState::signed_in(session),
            None => SessionState::signed_out(),
        });

        let local = if capabilities.local_store {
            match LocalStore::open(&config.db_path, Arc::clone(&clock), Arc::clone(&events)) {
                Ok(store) => Some(Arc::new(store)),
                Err(err) if err.is_init() => {
                    warn!(error = %err, "local store unusable; falling back to remote-only storage");
                    capabilities.local_store = false;
                    capabilities.background_sync = false;
                    None
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            None
        };

        let store: Arc<dyn HabitStore> = match &local {
            Some(local) => Arc::clone(local) as Arc<dyn HabitStore>,
            None => Arc::new(VolatileStore::new(
                remote.clone(),
                Arc::clone(&sessions) as Arc<dyn SessionProvider>,
                Arc::clone(&clock),
                Arc::clone(&events),
            )),
        };

        let coordinator = match (&local, remote) {
            (Some(local), Some(remote)) => Some(Arc::new(SyncCoordinator::new(
                Arc::clone(local),
                remote,
                Arc::clone(&sessions) as Arc<dyn SessionProvider>,
            ))),
            _ => None,
        };

        let app = Self {
            config,
            capabilities,
            clock,
            events,
            sessions,
            store,
            local,
            coordinator,
            service: None,
        };
        app.on_session_start(options)?;
        Ok(app)
    }

    fn on_session_start(&self, options: OpenOptions) -> Result<(), AppError> {
        let Some(session) = self.sessions.current() else {
            return Ok(());
        };
        if let Some(local) = &self.local {
            local.adopt_local_rows(&session.owner_id)?;
        }
        if !options.initial_sync {
            return Ok(());
        }
        if let Some(coordinator) = &self.coordinator {
            match coordinator.full_sync(&session.owner_id) {
                Ok(PassOutcome::Completed(summary)) => info!(
                    owner = %session.owner_id,
                    pulled = summary.pulled,
                    pushed = summary.pushed,
                    "startup sync completed"
                ),
                Ok(PassOutcome::Coalesced) => {}
                Err(err) => warn!(owner = %session.owner_id, error = %err, "startup sync failed"),
            }
        }
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn owner(&self) -> String {
        active_owner(self.sessions.as_ref())
    }

    pub fn today(&self) -> String {
        day_of(self.clock.now())
    }

    pub fn subscribe(&self) -> Receiver<DomainEvent> {
        self.events.subscribe()
    }

    pub fn store(&self) -> &dyn HabitStore {
        self.store.as_ref()
    }

    pub fn add_habit(&self, draft: HabitDraft) -> Result<Habit, AppError> {
        Ok(self.store.upsert_habit(&self.owner(), draft)?)
    }

    pub fn edit_habit(&self, id: &str, patch: HabitPatch) -> Result<Habit, AppError> {
        if !patch.has_changes() {
            return Err(AppError::InvalidArgument(
                "habit edit requires at least one change".to_string(),
            ));
        }
        let owner = self.owner();
        let current = self
            .store
            .get_habit(&owner, id)?
            .ok_or_else(|| AppError::NotFound(format!("habit '{id}'")))?;
        let mut draft = HabitDraft::from(&current);
        if let Some(name) = patch.name {
            draft.name = name;
        }
        if let Some(category) = patch.category {
            draft.category = category;
        }
        if let Some(is_goal) = patch.is_goal {
            draft.is_goal = is_goal;
        }
        if let Some(goal_id) = patch.goal_id {
            draft.goal_id = goal_id;
        }
        Ok(self.store.upsert_habit(&owner, draft)?)
    }

    pub fn list_habits(&self) -> Result<Vec<Habit>, AppError> {
        Ok(self.store.get_habits(&self.owner())?)
    }

    pub fn show_habit(&self, id: &str) -> Result<Option<Habit>, AppError> {
        Ok(self.store.get_habit(&self.owner(), id)?)
    }

    pub fn remove_habit(&self, id: &str) -> Result<(), AppError> {
        if self.store.delete_habit(&self.owner(), id)? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("habit '{id}'")))
        }
    }

    pub fn set_done(&self, habit_id: &str, date: Option<&str>, done: bool) -> Result<Completion, AppError> {
        let date = date.map(str::to_string).unwrap_or_else(|| self.today());
        Ok(self.store.set_completion(&self.owner(), habit_id, &date, done)?)
    }

    /// Every habit with its state on `date`; habits without a row are not done.
    pub fn day(&self, date: Option<&str>) -> Result<(String, Vec<DayEntry>), AppError> {
        let date = match date {
            Some(raw) => crate::domain::parse_day(raw)?,
            None => self.today(),
        };
        let owner = self.owner();
        let done: BTreeMap<String, bool> = self.store.get_completions(&date, &owner)?;
        let entries = self
            .store
            .get_habits(&owner)?
            .into_iter()
            .map(|habit| DayEntry {
                done: done.get(&habit.id).copied().unwrap_or(false),
                habit_id: habit.id,
                name: habit.name,
                category: habit.category,
            })
            .collect();
        Ok((date, entries))
    }

    pub fn save_routine(&self, draft: RoutineDraft) -> Result<Routine, AppError> {
        Ok(self.store.save_routine(&self.owner(), draft)?)
    }

    pub fn list_routines(&self) -> Result<Vec<Routine>, AppError> {
        Ok(self.store.list_routines(&self.owner())?)
    }

    pub fn remove_routine(&self, id: &str) -> Result<(), AppError> {
        if self.store.delete_routine(&self.owner(), id)? {
            Ok(())
        } else {
            Err(AppError::NotFound(format!("routine '{id}'")))
        }
    }

    pub fn sync(&self) -> Result<PassOutcome, AppError> {
        let coordinator = self.coordinator()?;
        Ok(coordinator.full_sync(&self.signed_in_owner()?)?)
    }

    pub fn outbox(&self) -> Result<Vec<OutboxEntry>, AppError> {
        match &self.local {
            Some(local) => Ok(local.pending_outbox(&self.owner(), None)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn status(&self) -> Result<AppStatus, AppError> {
        let owner = self.owner();
        let mut status = AppStatus {
            signed_in: self.sessions.current().is_some(),
            mode: self.capabilities.describe(),
            durable: self.store.is_durable(),
            db_path: self.local.as_ref().map(|local| local.path().to_string()),
            remote_url: self.config.remote.as_ref().map(|remote| remote.url.clone()),
            phase: SyncPhase::Idle,
            last_sync_at: None,
            last_error: None,
            pending: 0,
            owner_id: owner.clone(),
        };
        if let Some(coordinator) = &self.coordinator {
            let sync = coordinator.status(&owner)?;
            status.phase = sync.phase;
            status.last_sync_at = sync.last_sync_at;
            status.last_error = sync.last_error;
            status.pending = sync.pending;
        } else if let Some(local) = &self.local {
            status.last_sync_at = local.last_sync_at(&owner)?;
            status.pending = local.outbox_len(&owner)?;
        }
        Ok(status)
    }

    pub fn start_sync_service(&mut self, interval: Option<Duration>) -> Result<&SyncService, AppError> {
        if !self.capabilities.background_sync {
            return Err(AppError::Unavailable(format!(
                "background sync needs a local store and a remote ({})",
                self.capabilities.describe()
            )));
        }
        let coordinator = Arc::clone(self.coordinator()?);
        let interval = interval.unwrap_or(self.config.sync_interval);
        if self.service.is_none() {
            self.service = Some(coordinator.start_sync_service(interval)?);
        }
        self.service
            .as_ref()
            .ok_or_else(|| AppError::Unavailable("sync service did not start".to_string()))
    }

    pub fn sign_out(&self, policy: SignOutPolicy) -> Result<Option<String>, AppError> {
        let Some(session) = self.sessions.sign_out() else {
            return Ok(None);
        };
        if let Some(local) = &self.local {
            local.sign_out(&session.owner_id, policy)?;
        }
        Ok(Some(session.owner_id))
    }

    /// Stops background work; the store closes when the last handle drops.
    pub fn teardown(mut self) {
        if let Some(service) = self.service.take() {
            service.stop();
        }
    }

    fn coordinator(&self) -> Result<&Arc<SyncCoordinator>, AppError> {
        self.coordinator.as_ref().ok_or_else(|| {
            AppError::Unavailable(format!(
                "sync needs a local store and a configured remote ({})",
                self.capabilities.describe()
            ))
        })
    }

    fn signed_in_owner(&self) -> Result<String, AppError> {
        self.sessions
            .current()
            .map(|session| session.owner_id)
            .ok_or_else(|| {
                AppError::Unavailable("sync needs --owner and --access-token".to_string())
            })
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

impl From<crate::domain::InvalidDay> for AppError {
    fn from(value: crate::domain::InvalidDay) -> Self {
        AppError::Store(StoreError::InvalidDay(value))
    }
}

#[cfg(test)]
mod tests;
