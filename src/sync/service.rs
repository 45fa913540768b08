use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{PassOutcome, SyncCoordinator, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Pause,
    Resume,
    Trigger,
    Stop,
}

/// Handle to the background sync thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct SyncService {
    control: Sender<Control>,
    worker: Option<JoinHandle<()>>,
}

impl SyncCoordinator {
    /// Runs an incremental pass every `interval` while a session exists and
    /// the service is not paused.
    pub fn start_sync_service(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<SyncService, SyncError> {
        let (control, inbox) = mpsc::channel();
        let coordinator = Arc::clone(self);
        let worker = thread::Builder::new()
            .name("habitsync-sync".to_string())
            .spawn(move || {
                let mut paused = false;
                loop {
                    let due = match inbox.recv_timeout(interval) {
                        Ok(Control::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                        Ok(Control::Pause) => {
                            paused = true;
                            false
                        }
                        Ok(Control::Resume) => {
                            paused = false;
                            false
                        }
                        Ok(Control::Trigger) | Err(RecvTimeoutError::Timeout) => !paused,
                    };
                    if due {
                        coordinator.tick();
                    }
                }
                debug!("sync service stopped");
            })?;
        info!(interval_secs = interval.as_secs_f64(), "sync service started");
        Ok(SyncService {
            control,
            worker: Some(worker),
        })
    }

    fn tick(&self) {
        let Some(session) = self.sessions().current() else {
            debug!("no session; skipping sync tick");
            return;
        };
        match self.incremental_pass(&session.owner_id) {
            Ok(PassOutcome::Completed(summary)) if !summary.is_clean() => {
                warn!(owner = %session.owner_id, failed = summary.failed, "sync pass left work behind");
            }
            Ok(_) => {}
            Err(err) => warn!(owner = %session.owner_id, error = %err, "background sync pass failed"),
        }
    }
}

impl SyncService {
    /// Stops scheduling passes; a pass already running finishes normally.
    pub fn pause(&self) {
        self.send(Control::Pause);
    }

    pub fn resume(&self) {
        self.send(Control::Resume);
    }

    pub fn trigger(&self) {
        self.send(Control::Trigger);
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn send(&self, control: Control) {
        if self.control.send(control).is_err() {
            debug!(?control, "sync service already stopped");
        }
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = self.control.send(Control::Stop);
        if worker.join().is_err() {
            warn!("sync service thread panicked");
        }
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.shutdown();
    }
}
