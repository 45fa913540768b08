use std::time::Duration;

use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Result, Row};
use serde::Serialize;

use crate::clock::format_rfc3339;
use crate::domain::{Completion, EntityType, Habit, OutboxOp, Routine, RoutineStep};

pub const CURRENT_SCHEMA_VERSION: i64 = 3;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: [Migration; 3] = [
    Migration {
        version: 1,
        name: "baseline_habit_schema_v1",
        sql: r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS habits (
    owner_id TEXT NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    is_goal INTEGER NOT NULL DEFAULT 0,
    goal_id TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, id)
);

CREATE TABLE IF NOT EXISTS completions (
    owner_id TEXT NOT NULL,
    habit_id TEXT NOT NULL,
    date TEXT NOT NULL,
    done INTEGER NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, habit_id, date)
);

CREATE TABLE IF NOT EXISTS routines (
    owner_id TEXT NOT NULL,
    id TEXT NOT NULL,
    name TEXT NOT NULL,
    steps_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (owner_id, id)
);

CREATE INDEX IF NOT EXISTS idx_habits_goal ON habits(owner_id, goal_id);
CREATE INDEX IF NOT EXISTS idx_completions_date ON completions(owner_id, date);
"#,
    },
    Migration {
        version: 2,
        name: "sync_tracking_v1",
        sql: r#"
CREATE TABLE IF NOT EXISTS outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    owner_id TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    op TEXT NOT NULL,
    payload TEXT,
    enqueued_at TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);

CREATE TABLE IF NOT EXISTS sync_cursors (
    entity_type TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    last_synced_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, owner_id)
);

CREATE TABLE IF NOT EXISTS tombstones (
    entity_type TEXT NOT NULL,
    owner_id TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    deleted_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, owner_id, entity_id)
);

CREATE INDEX IF NOT EXISTS idx_outbox_entity
    ON outbox(owner_id, entity_type, entity_id);
"#,
    },
    Migration {
        version: 3,
        name: "outbox_rejections_v1",
        sql: r#"
ALTER TABLE outbox ADD COLUMN rejected INTEGER NOT NULL DEFAULT 0;
"#,
    },
];

pub fn open_connection(path: &str) -> Result<Connection> {
    let mut conn = Connection::open(path)?;
    configure_for_speed(&conn)?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    apply_migrations(&mut conn)?;
    Ok(conn)
}

fn configure_for_speed(conn: &Connection) -> Result<()> {
    conn.pragma_update(None::<DatabaseName>, "journal_mode", "WAL")?;
    conn.pragma_update(None::<DatabaseName>, "synchronous", "NORMAL")?;
    conn.pragma_update(None::<DatabaseName>, "temp_store", "MEMORY")?;
    conn.pragma_update(None::<DatabaseName>, "busy_timeout", 5000i64)?;
    conn.busy_timeout(Duration::from_millis(5000))?;
    Ok(())
}

fn apply_migrations(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction()?;
    tx.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#,
    )?;

    for migration in MIGRATIONS {
        let already_applied: Option<i64> = tx
            .query_row(
                "SELECT version FROM schema_migrations WHERE version = ?1",
                params![migration.version],
                |row| row.get(0),
            )
            .optional()?;

        if already_applied.is_some() {
            continue;
        }

        tx.execute_batch(migration.sql)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                migration.version,
                migration.name,
                format_rfc3339(time::OffsetDateTime::now_utc())
            ],
        )?;
    }

    tx.execute(
        r#"
INSERT INTO meta (key, value)
VALUES ('schema_version', ?1)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
        params![CURRENT_SCHEMA_VERSION.to_string()],
    )?;

    tx.commit()
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    conn.query_row(
        "SELECT value FROM meta WHERE key = ?1",
        params![key],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO meta (key, value)
VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
"#,
        params![key, value],
    )?;
    Ok(())
}

pub fn delete_meta(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
    Ok(())
}

fn habit_from_row(row: &Row<'_>) -> Result<Habit> {
    let category: String = row.get(2)?;
    Ok(Habit {
        id: row.get(0)?,
        name: row.get(1)?,
        category: category.parse().unwrap_or_default(),
        is_goal: row.get(3)?,
        goal_id: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

pub fn upsert_habit(conn: &Connection, owner_id: &str, habit: &Habit) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO habits (owner_id, id, name, category, is_goal, goal_id, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(owner_id, id) DO UPDATE SET
    name = excluded.name,
    category = excluded.category,
    is_goal = excluded.is_goal,
    goal_id = excluded.goal_id,
    created_at = habits.created_at,
    updated_at = excluded.updated_at
"#,
        params![
            owner_id,
            habit.id,
            habit.name,
            habit.category.as_str(),
            habit.is_goal,
            habit.goal_id,
            habit.created_at,
            habit.updated_at
        ],
    )?;
    Ok(())
}

pub fn get_habit(conn: &Connection, owner_id: &str, id: &str) -> Result<Option<Habit>> {
    conn.query_row(
        r#"
SELECT id, name, category, is_goal, goal_id, created_at, updated_at
FROM habits
WHERE owner_id = ?1 AND id = ?2
"#,
        params![owner_id, id],
        habit_from_row,
    )
    .optional()
}

pub fn list_habits(conn: &Connection, owner_id: &str) -> Result<Vec<Habit>> {
    let mut stmt = conn.prepare(
        r#"
SELECT id, name, category, is_goal, goal_id, created_at, updated_at
FROM habits
WHERE owner_id = ?1
ORDER BY created_at ASC, id ASC
"#,
    )?;
    let rows = stmt.query_map(params![owner_id], habit_from_row)?;
    rows.collect()
}

pub fn list_goal_children(conn: &Connection, owner_id: &str, goal_id: &str) -> Result<Vec<Habit>> {
    let mut stmt = conn.prepare(
        r#"
SELECT id, name, category, is_goal, goal_id, created_at, updated_at
FROM habits
WHERE owner_id = ?1 AND goal_id = ?2
ORDER BY id ASC
"#,
    )?;
    let rows = stmt.query_map(params![owner_id, goal_id], habit_from_row)?;
    rows.collect()
}

pub fn delete_habit(conn: &Connection, owner_id: &str, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM habits WHERE owner_id = ?1 AND id = ?2",
        params![owner_id, id],
    )?;
    Ok(changed > 0)
}

fn completion_from_row(row: &Row<'_>) -> Result<Completion> {
    Ok(Completion {
        habit_id: row.get(0)?,
        date: row.get(1)?,
        done: row.get(2)?,
        updated_at: row.get(3)?,
    })
}

pub fn upsert_completion(conn: &Connection, owner_id: &str, completion: &Completion) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO completions (owner_id, habit_id, date, done, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(owner_id, habit_id, date) DO UPDATE SET
    done = excluded.done,
    updated_at = excluded.updated_at
"#,
        params![
            owner_id,
            completion.habit_id,
            completion.date,
            completion.done,
            completion.updated_at
        ],
    )?;
    Ok(())
}

pub fn get_completion(
    conn: &Connection,
    owner_id: &str,
    habit_id: &str,
    date: &str,
) -> Result<Option<Completion>> {
    conn.query_row(
        r#"
SELECT habit_id, date, done, updated_at
FROM completions
WHERE owner_id = ?1 AND habit_id = ?2 AND date = ?3
"#,
        params![owner_id, habit_id, date],
        completion_from_row,
    )
    .optional()
}

pub fn completions_for_day(conn: &Connection, owner_id: &str, date: &str) -> Result<Vec<Completion>> {
    let mut stmt = conn.prepare(
        r#"
SELECT habit_id, date, done, updated_at
FROM completions
WHERE owner_id = ?1 AND date = ?2
ORDER BY habit_id ASC
"#,
    )?;
    let rows = stmt.query_map(params![owner_id, date], completion_from_row)?;
    rows.collect()
}

pub fn completions_for_habit(
    conn: &Connection,
    owner_id: &str,
    habit_id: &str,
) -> Result<Vec<Completion>> {
    let mut stmt = conn.prepare(
        r#"
SELECT habit_id, date, done, updated_at
FROM completions
WHERE owner_id = ?1 AND habit_id = ?2
ORDER BY date ASC
"#,
    )?;
    let rows = stmt.query_map(params![owner_id, habit_id], completion_from_row)?;
    rows.collect()
}

pub fn delete_completion(conn: &Connection, owner_id: &str, habit_id: &str, date: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM completions WHERE owner_id = ?1 AND habit_id = ?2 AND date = ?3",
        params![owner_id, habit_id, date],
    )?;
    Ok(changed > 0)
}

fn routine_from_row(row: &Row<'_>) -> Result<Routine> {
    let steps_json: String = row.get(2)?;
    let steps: Vec<RoutineStep> = serde_json::from_str(&steps_json).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(err))
    })?;
    Ok(Routine {
        id: row.get(0)?,
        name: row.get(1)?,
        steps,
        created_at: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

pub fn upsert_routine(conn: &Connection, owner_id: &str, routine: &Routine) -> Result<()> {
    let steps_json = serde_json::to_string(&routine.steps)
        .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
    conn.execute(
        r#"
INSERT INTO routines (owner_id, id, name, steps_json, created_at, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
ON CONFLICT(owner_id, id) DO UPDATE SET
    name = excluded.name,
    steps_json = excluded.steps_json,
    created_at = routines.created_at,
    updated_at = excluded.updated_at
"#,
        params![
            owner_id,
            routine.id,
            routine.name,
            steps_json,
            routine.created_at,
            routine.updated_at
        ],
    )?;
    Ok(())
}

pub fn get_routine(conn: &Connection, owner_id: &str, id: &str) -> Result<Option<Routine>> {
    conn.query_row(
        r#"
SELECT id, name, steps_json, created_at, updated_at
FROM routines
WHERE owner_id = ?1 AND id = ?2
"#,
        params![owner_id, id],
        routine_from_row,
    )
    .optional()
}

pub fn list_routines(conn: &Connection, owner_id: &str) -> Result<Vec<Routine>> {
    let mut stmt = conn.prepare(
        r#"
SELECT id, name, steps_json, created_at, updated_at
FROM routines
WHERE owner_id = ?1
ORDER BY created_at ASC, id ASC
"#,
    )?;
    let rows = stmt.query_map(params![owner_id], routine_from_row)?;
    rows.collect()
}

pub fn delete_routine(conn: &Connection, owner_id: &str, id: &str) -> Result<bool> {
    let changed = conn.execute(
        "DELETE FROM routines WHERE owner_id = ?1 AND id = ?2",
        params![owner_id, id],
    )?;
    Ok(changed > 0)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboxEntry {
    pub seq: i64,
    pub owner_id: String,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub op: OutboxOp,
    pub payload: Option<String>,
    pub enqueued_at: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    /// The server refused this entry outright. It is not sent again until the
    /// row changes locally.
    pub rejected: bool,
}

pub struct NewOutboxEntry<'a> {
    pub owner_id: &'a str,
    pub entity_type: EntityType,
    pub entity_id: &'a str,
    pub op: OutboxOp,
    pub payload: Option<&'a str>,
    pub enqueued_at: &'a str,
}

fn outbox_from_row(row: &Row<'_>) -> Result<OutboxEntry> {
    let entity_raw: String = row.get(2)?;
    let op_raw: String = row.get(4)?;
    let entity_type = entity_raw.parse().map_err(|msg: String| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, msg.into())
    })?;
    let op = op_raw.parse().map_err(|msg: String| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, msg.into())
    })?;
    Ok(OutboxEntry {
        seq: row.get(0)?,
        owner_id: row.get(1)?,
        entity_type,
        entity_id: row.get(3)?,
        op,
        payload: row.get(5)?,
        enqueued_at: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        rejected: row.get(9)?,
    })
}

const OUTBOX_COLUMNS: &str =
    "seq, owner_id, entity_type, entity_id, op, payload, enqueued_at, attempts, last_error, rejected";

pub fn enqueue_outbox(conn: &Connection, entry: &NewOutboxEntry<'_>) -> Result<i64> {
    conn.execute(
        r#"
INSERT INTO outbox (owner_id, entity_type, entity_id, op, payload, enqueued_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
        params![
            entry.owner_id,
            entry.entity_type.as_str(),
            entry.entity_id,
            entry.op.as_str(),
            entry.payload,
            entry.enqueued_at
        ],
    )?;
    let seq = conn.last_insert_rowid();
    // A fresh change gives earlier rejected entries for the row another try.
    conn.execute(
        "UPDATE outbox SET rejected = 0 WHERE owner_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
        params![entry.owner_id, entry.entity_type.as_str(), entry.entity_id],
    )?;
    Ok(seq)
}

pub fn pending_outbox(
    conn: &Connection,
    owner_id: &str,
    entity_type: Option<EntityType>,
) -> Result<Vec<OutboxEntry>> {
    let mut result = Vec::new();
    match entity_type {
        Some(entity) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE owner_id = ?1 AND entity_type = ?2 ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map(params![owner_id, entity.as_str()], outbox_from_row)?;
            for row in rows {
                result.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {OUTBOX_COLUMNS} FROM outbox WHERE owner_id = ?1 ORDER BY seq ASC"
            ))?;
            let rows = stmt.query_map(params![owner_id], outbox_from_row)?;
            for row in rows {
                result.push(row?);
            }
        }
    }
    Ok(result)
}

pub fn pending_for_entity(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM outbox \
         WHERE owner_id = ?1 AND entity_type = ?2 AND entity_id = ?3 ORDER BY seq ASC"
    ))?;
    let rows = stmt.query_map(
        params![owner_id, entity_type.as_str(), entity_id],
        outbox_from_row,
    )?;
    rows.collect()
}

pub fn remove_outbox(conn: &Connection, seq: i64) -> Result<()> {
    conn.execute("DELETE FROM outbox WHERE seq = ?1", params![seq])?;
    Ok(())
}

pub fn remove_outbox_for_entity(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<usize> {
    conn.execute(
        "DELETE FROM outbox WHERE owner_id = ?1 AND entity_type = ?2 AND entity_id = ?3",
        params![owner_id, entity_type.as_str(), entity_id],
    )
}

pub fn record_outbox_failure(
    conn: &Connection,
    seq: i64,
    message: &str,
    rejected: bool,
) -> Result<()> {
    conn.execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?2, rejected = ?3 WHERE seq = ?1",
        params![seq, message, rejected],
    )?;
    Ok(())
}

pub fn outbox_len(conn: &Connection, owner_id: &str) -> Result<u64> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE owner_id = ?1",
        params![owner_id],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

pub fn get_cursor(conn: &Connection, owner_id: &str, entity_type: EntityType) -> Result<Option<String>> {
    conn.query_row(
        "SELECT last_synced_at FROM sync_cursors WHERE entity_type = ?1 AND owner_id = ?2",
        params![entity_type.as_str(), owner_id],
        |row| row.get(0),
    )
    .optional()
}

pub fn set_cursor(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    last_synced_at: &str,
) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO sync_cursors (entity_type, owner_id, last_synced_at)
VALUES (?1, ?2, ?3)
ON CONFLICT(entity_type, owner_id) DO UPDATE SET last_synced_at = excluded.last_synced_at
"#,
        params![entity_type.as_str(), owner_id, last_synced_at],
    )?;
    Ok(())
}

pub fn record_tombstone(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    deleted_at: &str,
) -> Result<()> {
    conn.execute(
        r#"
INSERT INTO tombstones (entity_type, owner_id, entity_id, deleted_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(entity_type, owner_id, entity_id) DO NOTHING
"#,
        params![entity_type.as_str(), owner_id, entity_id, deleted_at],
    )?;
    Ok(())
}

pub fn has_tombstone(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
) -> Result<bool> {
    let exists: i64 = conn.query_row(
        r#"
SELECT EXISTS(
    SELECT 1 FROM tombstones WHERE entity_type = ?1 AND owner_id = ?2 AND entity_id = ?3
)
"#,
        params![entity_type.as_str(), owner_id, entity_id],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

/// Stamps a row with the server's canonical `updated_at`. Completion ids use
/// the `habit_id@date` remote form.
pub fn set_updated_at(
    conn: &Connection,
    owner_id: &str,
    entity_type: EntityType,
    entity_id: &str,
    updated_at: &str,
) -> Result<bool> {
    let changed = match entity_type {
        EntityType::Habit => conn.execute(
            "UPDATE habits SET updated_at = ?3 WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, entity_id, updated_at],
        )?,
        EntityType::Routine => conn.execute(
            "UPDATE routines SET updated_at = ?3 WHERE owner_id = ?1 AND id = ?2",
            params![owner_id, entity_id, updated_at],
        )?,
        EntityType::Completion => match entity_id.split_once('@') {
            Some((habit_id, date)) => conn.execute(
                r#"
UPDATE completions SET updated_at = ?4
WHERE owner_id = ?1 AND habit_id = ?2 AND date = ?3
"#,
                params![owner_id, habit_id, date, updated_at],
            )?,
            None => 0,
        },
    };
    Ok(changed > 0)
}

/// Moves every row, pending change and watermark from one owner to another.
/// Rows the target already holds are left alone on the source side and then
/// dropped with it.
pub fn reassign_owner(conn: &Connection, from: &str, to: &str) -> Result<()> {
    for table in ["habits", "completions", "routines", "tombstones"] {
        conn.execute(
            &format!("UPDATE OR IGNORE {table} SET owner_id = ?2 WHERE owner_id = ?1"),
            params![from, to],
        )?;
    }
    conn.execute(
        "UPDATE outbox SET owner_id = ?2 WHERE owner_id = ?1",
        params![from, to],
    )?;
    purge_owner(conn, from)
}

pub fn purge_owner(conn: &Connection, owner_id: &str) -> Result<()> {
    for table in [
        "habits",
        "completions",
        "routines",
        "outbox",
        "sync_cursors",
        "tombstones",
    ] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE owner_id = ?1"),
            params![owner_id],
        )?;
    }
    Ok(())
}
