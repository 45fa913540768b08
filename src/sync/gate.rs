use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One pass per owner at a time. Acquisition never blocks: a caller that finds
/// the owner busy gets `None` and coalesces into the running pass.
#[derive(Debug, Default)]
pub struct PassGate {
    running: Mutex<HashSet<String>>,
}

impl PassGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, owner_id: &str) -> Option<PassGuard<'_>> {
        if !self.lock().insert(owner_id.to_string()) {
            return None;
        }
        Some(PassGuard {
            gate: self,
            owner_id: owner_id.to_string(),
        })
    }

    #[cfg(test)]
    pub fn is_running(&self, owner_id: &str) -> bool {
        self.lock().contains(owner_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<String>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct PassGuard<'a> {
    gate: &'a PassGate,
    owner_id: String,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.gate.lock().remove(&self.owner_id);
    }
}
