use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Record families the sync engine moves between the local and remote stores.
/// Sync passes visit them in `ALL` order so goals and habits land before the
/// completions and routines that point at them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Habit,
    Completion,
    Routine,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [
        EntityType::Habit,
        EntityType::Completion,
        EntityType::Routine,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Habit => "habit",
            EntityType::Completion => "completion",
            EntityType::Routine => "routine",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityType::Habit => "habits",
            EntityType::Completion => "completions",
            EntityType::Routine => "routines",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .into_iter()
            .find(|entity| entity.as_str() == value)
            .ok_or_else(|| format!("unknown entity type '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    Upsert,
    Delete,
}

impl OutboxOp {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboxOp::Upsert => "upsert",
            OutboxOp::Delete => "delete",
        }
    }
}

impl FromStr for OutboxOp {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "upsert" => Ok(OutboxOp::Upsert),
            "delete" => Ok(OutboxOp::Delete),
            other => Err(format!("unknown outbox op '{other}'")),
        }
    }
}
