//! In-process stand-in for the hosted row store, used by sync tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use serde_json::Value;
use time::{Duration, OffsetDateTime};

use crate::clock::{compare_timestamps, format_rfc3339, parse_rfc3339};
use crate::domain::EntityType;
use crate::session::Session;

use super::{RemoteError, RemoteRecord, RemoteStore};

type RowKey = (EntityType, String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Fetch,
    Push,
    Delete,
}

#[derive(Debug)]
struct State {
    rows: BTreeMap<RowKey, RemoteRecord>,
    server_time: OffsetDateTime,
    offline: bool,
    revoked_tokens: Vec<String>,
    scripted_failures: VecDeque<(Call, Option<String>, RemoteError)>,
    calls: Vec<(Call, EntityType, Option<String>)>,
}

#[derive(Debug)]
pub struct MemoryRemote {
    state: Mutex<State>,
}

impl MemoryRemote {
    pub fn new(server_time: &str) -> Self {
        Self {
            state: Mutex::new(State {
                rows: BTreeMap::new(),
                server_time: parse_rfc3339(server_time).expect("server time should parse"),
                offline: false,
                revoked_tokens: Vec::new(),
                scripted_failures: VecDeque::new(),
                calls: Vec::new(),
            }),
        }
    }

    /// Writes a row as if another device had pushed it at `updated_at`.
    pub fn seed(&self, owner: &str, entity: EntityType, id: &str, data: Value, updated_at: &str) {
        let mut state = self.lock();
        state.rows.insert(
            (entity, owner.to_string(), id.to_string()),
            RemoteRecord {
                id: id.to_string(),
                data: Some(data),
                deleted: false,
                updated_at: updated_at.to_string(),
            },
        );
    }

    pub fn seed_tombstone(&self, owner: &str, entity: EntityType, id: &str, updated_at: &str) {
        let mut state = self.lock();
        state.rows.insert(
            (entity, owner.to_string(), id.to_string()),
            RemoteRecord::tombstone(id, updated_at),
        );
    }

    pub fn row(&self, owner: &str, entity: EntityType, id: &str) -> Option<RemoteRecord> {
        self.lock()
            .rows
            .get(&(entity, owner.to_string(), id.to_string()))
            .cloned()
    }

    pub fn live_ids(&self, owner: &str, entity: EntityType) -> Vec<String> {
        self.lock()
            .rows
            .iter()
            .filter(|((e, o, _), record)| *e == entity && o == owner && !record.deleted)
            .map(|((_, _, id), _)| id.clone())
            .collect()
    }

    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    pub fn revoke(&self, token: &str) {
        self.lock().revoked_tokens.push(token.to_string());
    }

    pub fn set_server_time(&self, raw: &str) {
        self.lock().server_time = parse_rfc3339(raw).expect("server time should parse");
    }

    /// Fails the next matching call once. `id` of `None` matches any row.
    pub fn fail_next(&self, call: Call, id: Option<&str>, err: RemoteError) {
        self.lock()
            .scripted_failures
            .push_back((call, id.map(str::to_string), err));
    }

    pub fn calls(&self) -> Vec<(Call, EntityType, Option<String>)> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl State {
    fn admit(
        &mut self,
        session: &Session,
        call: Call,
        entity: EntityType,
        id: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.calls.push((call, entity, id.map(str::to_string)));
        if self.offline {
            return Err(RemoteError::Network("connection refused".to_string()));
        }
        if self.revoked_tokens.contains(&session.access_token) {
            return Err(RemoteError::Auth("JWT expired".to_string()));
        }
        let position = self.scripted_failures.iter().position(|(c, target, _)| {
            *c == call && target.as_deref().is_none_or(|target| Some(target) == id)
        });
        if let Some(index) = position {
            if let Some((_, _, err)) = self.scripted_failures.remove(index) {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Server clock that never repeats, so every write gets a distinct stamp.
    fn tick(&mut self) -> String {
        self.server_time += Duration::milliseconds(1);
        format_rfc3339(self.server_time)
    }
}

impl RemoteStore for MemoryRemote {
    fn fetch_since(
        &self,
        session: &Session,
        entity: EntityType,
        cursor: Option<&str>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let mut state = self.lock();
        state.admit(session, Call::Fetch, entity, None)?;
        let mut records: Vec<RemoteRecord> = state
            .rows
            .iter()
            .filter(|((e, owner, _), _)| *e == entity && *owner == session.owner_id)
            .map(|(_, record)| record.clone())
            .filter(|record| {
                cursor.is_none_or(|cursor| {
                    compare_timestamps(&record.updated_at, cursor) == std::cmp::Ordering::Greater
                })
            })
            .collect();
        records.sort_by(|a, b| compare_timestamps(&a.updated_at, &b.updated_at));
        Ok(records)
    }

    fn push(
        &self,
        session: &Session,
        entity: EntityType,
        id: &str,
        data: &Value,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.lock();
        state.admit(session, Call::Push, entity, Some(id))?;
        let key = (entity, session.owner_id.clone(), id.to_string());
        if let Some(existing) = state.rows.get(&key) {
            if existing.deleted {
                return Ok(existing.clone());
            }
        }
        let record = RemoteRecord {
            id: id.to_string(),
            data: Some(data.clone()),
            deleted: false,
            updated_at: state.tick(),
        };
        state.rows.insert(key, record.clone());
        Ok(record)
    }

    fn delete(
        &self,
        session: &Session,
        entity: EntityType,
        id: &str,
    ) -> Result<RemoteRecord, RemoteError> {
        let mut state = self.lock();
        state.admit(session, Call::Delete, entity, Some(id))?;
        let key = (entity, session.owner_id.clone(), id.to_string());
        if let Some(existing) = state.rows.get(&key) {
            if existing.deleted {
                return Ok(existing.clone());
            }
        }
        let record = RemoteRecord::tombstone(id, state.tick());
        state.rows.insert(key, record.clone());
        Ok(record)
    }
}
