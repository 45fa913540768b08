use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::clock::{compare_timestamps, later_of};
use crate::db;
use crate::domain::{EntityType, OutboxOp};
use crate::events::DomainEvent;
use crate::remote::{RemoteError, RemoteRecord, RemoteStore};
use crate::session::{Session, SessionProvider};
use crate::store::{LocalStore, StoreError};

mod apply;
mod gate;
mod service;

use apply::{PullDecision, RecordApplier};
use gate::PassGate;
pub use service::SyncService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    SyncingPull,
    SyncingPush,
    SyncingFull,
}

impl SyncPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::SyncingPull => "syncing_pull",
            SyncPhase::SyncingPush => "syncing_push",
            SyncPhase::SyncingFull => "syncing_full",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub pulled: u64,
    pub applied: u64,
    pub deleted: u64,
    pub kept_local: u64,
    pub ignored: u64,
    pub waiting: u64,
    pub skipped: u64,
    pub conflicts_discarded: u64,
    pub pushed: u64,
    pub failed: u64,
    pub deferred: u64,
    /// Rejected entries left in the outbox until their row changes again.
    pub parked: u64,
    pub errors: Vec<String>,
}

impl SyncSummary {
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.errors.is_empty()
    }

    fn record_pull(&mut self, decision: PullDecision, discarded: u64) {
        self.pulled += 1;
        self.conflicts_discarded += discarded;
        match decision {
            PullDecision::Applied => self.applied += 1,
            PullDecision::Deleted => self.deleted += 1,
            PullDecision::KeptLocal => self.kept_local += 1,
            PullDecision::Ignored => self.ignored += 1,
            PullDecision::Waiting => self.waiting += 1,
            PullDecision::Skipped => self.skipped += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed(SyncSummary),
    /// Another pass for the same owner was already running.
    Coalesced,
}

/// Everything a sync badge needs to render.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncStatus {
    pub owner_id: String,
    pub phase: SyncPhase,
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
    pub pending: u64,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("no signed-in session for '{0}'")]
    SignedOut(String),
    #[error("authentication rejected during sync: {0}")]
    Auth(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to start sync service: {0}")]
    Spawn(#[from] std::io::Error),
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        SyncError::Store(StoreError::Db(value))
    }
}

/// Per-owner progress. Owners without an entry are idle with no error.
#[derive(Debug, Default)]
struct CoordinatorState {
    phases: HashMap<String, SyncPhase>,
    last_errors: HashMap<String, String>,
}

/// Moves changes between the local store and the remote. Pull always runs
/// before push within a pass, and at most one pass runs per owner.
pub struct SyncCoordinator {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    sessions: Arc<dyn SessionProvider>,
    gate: PassGate,
    state: Mutex<CoordinatorState>,
}

impl SyncCoordinator {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        Self {
            store,
            remote,
            sessions,
            gate: PassGate::new(),
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    pub fn phase(&self, owner_id: &str) -> SyncPhase {
        self.lock_state()
            .phases
            .get(owner_id)
            .copied()
            .unwrap_or(SyncPhase::Idle)
    }

    #[cfg(test)]
    pub fn gate(&self) -> &PassGate {
        &self.gate
    }

    pub fn sessions(&self) -> &Arc<dyn SessionProvider> {
        &self.sessions
    }

    pub fn status(&self, owner_id: &str) -> Result<SyncStatus, SyncError> {
        let phase = self.phase(owner_id);
        let last_error = self.lock_state().last_errors.get(owner_id).cloned();
        Ok(SyncStatus {
            owner_id: owner_id.to_string(),
            phase,
            last_sync_at: self.store.last_sync_at(owner_id)?,
            last_error,
            pending: self.store.outbox_len(owner_id)?,
        })
    }

    /// Entity by entity in dependency order: pull, then push that type.
    pub fn full_sync(&self, owner_id: &str) -> Result<PassOutcome, SyncError> {
        self.run_pass(owner_id, |session, summary| {
            self.set_phase(owner_id, SyncPhase::SyncingFull);
            for entity in EntityType::ALL {
                self.pull_entity(session, entity, summary)?;
                self.push_pending(session, Some(entity), summary)?;
            }
            Ok(())
        })
    }

    /// Pulls every entity type, then drains the whole outbox in `seq` order.
    pub fn incremental_pass(&self, owner_id: &str) -> Result<PassOutcome, SyncError> {
        self.run_pass(owner_id, |session, summary| {
            self.set_phase(owner_id, SyncPhase::SyncingPull);
            for entity in EntityType::ALL {
                self.pull_entity(session, entity, summary)?;
            }
            self.set_phase(owner_id, SyncPhase::SyncingPush);
            self.push_pending(session, None, summary)
        })
    }

    fn run_pass<F>(&self, owner_id: &str, body: F) -> Result<PassOutcome, SyncError>
    where
        F: FnOnce(&Session, &mut SyncSummary) -> Result<(), SyncError>,
    {
        let session = self
            .sessions
            .current()
            .filter(|session| session.owner_id == owner_id)
            .ok_or_else(|| SyncError::SignedOut(owner_id.to_string()))?;

        let Some(_guard) = self.gate.try_acquire(owner_id) else {
            debug!(owner = owner_id, "sync pass already running; coalesced");
            return Ok(PassOutcome::Coalesced);
        };

        let mut summary = SyncSummary::default();
        let result = body(&session, &mut summary);
        self.set_phase(owner_id, SyncPhase::Idle);

        match result {
            Ok(()) => {
                self.finish_pass(owner_id, &summary)?;
                Ok(PassOutcome::Completed(summary))
            }
            Err(err) => {
                warn!(owner = owner_id, error = %err, "sync pass aborted");
                self.lock_state()
                    .last_errors
                    .insert(owner_id.to_string(), err.to_string());
                self.store.events().publish(DomainEvent::SyncFailed {
                    owner_id: owner_id.to_string(),
                    entity: None,
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn finish_pass(&self, owner_id: &str, summary: &SyncSummary) -> Result<(), SyncError> {
        let now = self.store.clock().now_rfc3339();
        self.store.record_sync_success(owner_id, &now)?;
        {
            let mut state = self.lock_state();
            match summary.errors.first() {
                Some(first) => state.last_errors.insert(owner_id.to_string(), first.clone()),
                None => state.last_errors.remove(owner_id),
            };
        }
        info!(
            owner = owner_id,
            pulled = summary.pulled,
            pushed = summary.pushed,
            failed = summary.failed,
            conflicts_discarded = summary.conflicts_discarded,
            "sync pass completed"
        );
        self.store.events().publish(DomainEvent::SyncCompleted {
            owner_id: owner_id.to_string(),
            pulled: summary.pulled,
            pushed: summary.pushed,
            failed: summary.failed,
        });
        Ok(())
    }

    fn pull_entity(
        &self,
        session: &Session,
        entity: EntityType,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let owner_id = session.owner_id.as_str();
        let cursor = self
            .store
            .read(|conn| Ok(db::get_cursor(conn, owner_id, entity)?))?;

        let records = match self.remote.fetch_since(session, entity, cursor.as_deref()) {
            Ok(records) => records,
            Err(err) => return self.remote_failure(owner_id, entity, err, summary),
        };
        if records.is_empty() {
            return Ok(());
        }

        self.store.write(|tx| {
            let applier = RecordApplier::new(tx, owner_id);
            let mut oldest_waiting: Option<&str> = None;
            for record in &records {
                let outcome = applier.apply_pulled(entity, record)?;
                if outcome.decision == PullDecision::Waiting {
                    let stamp = record.updated_at.as_str();
                    oldest_waiting = Some(match oldest_waiting {
                        Some(oldest) if compare_timestamps(oldest, stamp).is_le() => oldest,
                        _ => stamp,
                    });
                }
                summary.record_pull(outcome.decision, outcome.discarded);
            }
            if let Some(next) = next_cursor(&records, oldest_waiting, cursor.as_deref()) {
                db::set_cursor(tx, owner_id, entity, &next)?;
            }
            Ok(())
        })?;
        debug!(owner = owner_id, %entity, pulled = records.len(), "pulled remote changes");
        Ok(())
    }

    fn push_pending(
        &self,
        session: &Session,
        entity: Option<EntityType>,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        let owner_id = session.owner_id.as_str();
        let entries = self.store.pending_outbox(owner_id, entity)?;
        let mut blocked: HashSet<(EntityType, String)> = HashSet::new();

        for entry in entries {
            let key = (entry.entity_type, entry.entity_id.clone());
            if blocked.contains(&key) {
                summary.deferred += 1;
                continue;
            }
            if entry.rejected {
                summary.parked += 1;
                blocked.insert(key);
                continue;
            }

            let result = match entry.op {
                OutboxOp::Upsert => match entry.payload.as_deref().map(serde_json::from_str::<serde_json::Value>) {
                    Some(Ok(payload)) => {
                        self.remote
                            .push(session, entry.entity_type, &entry.entity_id, &payload)
                    }
                    Some(Err(err)) => Err(RemoteError::Decode(format!("corrupt outbox payload: {err}"))),
                    None => Err(RemoteError::Decode("upsert entry has no payload".to_string())),
                },
                OutboxOp::Delete => self
                    .remote
                    .delete(session, entry.entity_type, &entry.entity_id),
            };

            match result {
                Ok(record) => {
                    self.store.write(|tx| {
                        RecordApplier::new(tx, owner_id).confirm_push(&entry, &record)
                    })?;
                    summary.pushed += 1;
                }
                Err(err) if err.is_auth() => return Err(SyncError::Auth(err.to_string())),
                Err(err) => {
                    let message = err.to_string();
                    if err.is_transient() {
                        warn!(
                            owner = owner_id,
                            entity = %entry.entity_type,
                            id = %entry.entity_id,
                            attempts = entry.attempts + 1,
                            error = %message,
                            "push failed; entry kept for the next pass"
                        );
                    } else {
                        // Retrying the same request will not help; surface it.
                        error!(
                            owner = owner_id,
                            entity = %entry.entity_type,
                            id = %entry.entity_id,
                            attempts = entry.attempts + 1,
                            error = %message,
                            "push rejected; entry parked until the row changes"
                        );
                        self.store.events().publish(DomainEvent::SyncFailed {
                            owner_id: owner_id.to_string(),
                            entity: Some(entry.entity_type),
                            message: message.clone(),
                        });
                    }
                    let rejected = !err.is_transient();
                    self.store.write(|tx| {
                        Ok(db::record_outbox_failure(tx, entry.seq, &message, rejected)?)
                    })?;
                    summary.failed += 1;
                    summary
                        .errors
                        .push(format!("{} '{}': {message}", entry.entity_type, entry.entity_id));
                    blocked.insert(key);
                }
            }
        }
        Ok(())
    }

    /// Auth ends the pass; anything else is noted and the pass moves on.
    fn remote_failure(
        &self,
        owner_id: &str,
        entity: EntityType,
        err: RemoteError,
        summary: &mut SyncSummary,
    ) -> Result<(), SyncError> {
        if err.is_auth() {
            return Err(SyncError::Auth(err.to_string()));
        }
        warn!(owner = owner_id, %entity, error = %err, "pull failed");
        summary.errors.push(format!("pull {entity}: {err}"));
        self.store.events().publish(DomainEvent::SyncFailed {
            owner_id: owner_id.to_string(),
            entity: Some(entity),
            message: err.to_string(),
        });
        Ok(())
    }

    fn set_phase(&self, owner_id: &str, phase: SyncPhase) {
        let mut state = self.lock_state();
        if phase == SyncPhase::Idle {
            state.phases.remove(owner_id);
        } else {
            state.phases.insert(owner_id.to_string(), phase);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The newest pulled stamp, held strictly before any record that has to be
/// fetched again. Never moves the cursor backwards.
fn next_cursor(
    records: &[RemoteRecord],
    oldest_waiting: Option<&str>,
    cursor: Option<&str>,
) -> Option<String> {
    let newest = records
        .iter()
        .map(|record| record.updated_at.as_str())
        .filter(|stamp| {
            oldest_waiting.is_none_or(|waiting| compare_timestamps(stamp, waiting).is_lt())
        })
        .max_by(|left, right| compare_timestamps(left, right))?;
    Some(match cursor {
        Some(cursor) => later_of(newest, cursor).to_string(),
        None => newest.to_string(),
    })
}
