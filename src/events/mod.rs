use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;

use serde::Serialize;

use crate::domain::EntityType;

/// Everything observers can be told about. Store mutations publish after the
/// owning transaction commits; the sync coordinator publishes once per pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    HabitCreated {
        owner_id: String,
        habit_id: String,
    },
    HabitUpdated {
        owner_id: String,
        habit_id: String,
    },
    HabitDeleted {
        owner_id: String,
        habit_id: String,
    },
    CompletionSet {
        owner_id: String,
        habit_id: String,
        date: String,
        done: bool,
    },
    RoutineSaved {
        owner_id: String,
        routine_id: String,
    },
    RoutineDeleted {
        owner_id: String,
        routine_id: String,
    },
    SyncCompleted {
        owner_id: String,
        pulled: u64,
        pushed: u64,
        failed: u64,
    },
    SyncFailed {
        owner_id: String,
        entity: Option<EntityType>,
        message: String,
    },
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::HabitCreated { .. } => "habit_created",
            DomainEvent::HabitUpdated { .. } => "habit_updated",
            DomainEvent::HabitDeleted { .. } => "habit_deleted",
            DomainEvent::CompletionSet { .. } => "completion_set",
            DomainEvent::RoutineSaved { .. } => "routine_saved",
            DomainEvent::RoutineDeleted { .. } => "routine_deleted",
            DomainEvent::SyncCompleted { .. } => "sync_completed",
            DomainEvent::SyncFailed { .. } => "sync_failed",
        }
    }

    pub fn owner_id(&self) -> &str {
        match self {
            DomainEvent::HabitCreated { owner_id, .. }
            | DomainEvent::HabitUpdated { owner_id, .. }
            | DomainEvent::HabitDeleted { owner_id, .. }
            | DomainEvent::CompletionSet { owner_id, .. }
            | DomainEvent::RoutineSaved { owner_id, .. }
            | DomainEvent::RoutineDeleted { owner_id, .. }
            | DomainEvent::SyncCompleted { owner_id, .. }
            | DomainEvent::SyncFailed { owner_id, .. } => owner_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<DomainEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<DomainEvent> {
        let (tx, rx) = mpsc::channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: DomainEvent) {
        tracing::trace!(event = event.name(), owner = event.owner_id(), "publish");
        self.lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<DomainEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests;
