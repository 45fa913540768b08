use crate::config::Config;
use crate::store::LocalStore;

/// What this process can do, decided once at startup so nothing downstream
/// branches on platform details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub local_store: bool,
    pub remote: bool,
    pub background_sync: bool,
}

impl Capabilities {
    pub fn detect(config: &Config) -> Self {
        Self::from_parts(config, LocalStore::is_available())
    }

    pub(crate) fn from_parts(config: &Config, local_store: bool) -> Self {
        let remote = config.remote.is_some();
        Self {
            local_store,
            remote,
            // The background loop only drains an outbox, which needs both ends.
            background_sync: local_store && remote && config.background_sync,
        }
    }

    pub fn describe(&self) -> &'static str {
        match (self.local_store, self.remote) {
            (true, true) => "local-first with remote sync",
            (true, false) => "local only",
            (false, true) => "remote only (volatile cache)",
            (false, false) => "volatile memory only",
        }
    }
}
