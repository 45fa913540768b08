use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::macros::format_description;
use time::{Date, OffsetDateTime, UtcOffset};

use super::Category;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Habit {
    pub id: String,
    pub name: String,
    pub category: Category,
    #[serde(default)]
    pub is_goal: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Caller-supplied fields for creating or replacing a habit. A missing `id`
/// creates a new habit; timestamps are always assigned by the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HabitDraft {
    pub id: Option<String>,
    pub name: String,
    pub category: Category,
    pub is_goal: bool,
    pub goal_id: Option<String>,
}

impl HabitDraft {
    pub fn new(name: impl Into<String>, category: Category) -> Self {
        Self {
            name: name.into(),
            category,
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn as_goal(mut self) -> Self {
        self.is_goal = true;
        self
    }

    pub fn under_goal(mut self, goal_id: impl Into<String>) -> Self {
        self.goal_id = Some(goal_id.into());
        self
    }
}

impl From<&Habit> for HabitDraft {
    fn from(habit: &Habit) -> Self {
        Self {
            id: Some(habit.id.clone()),
            name: habit.name.clone(),
            category: habit.category,
            is_goal: habit.is_goal,
            goal_id: habit.goal_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub habit_id: String,
    pub date: String,
    pub done: bool,
    pub updated_at: String,
}

impl Completion {
    pub fn remote_id(&self) -> String {
        completion_key(&self.habit_id, &self.date)
    }
}

pub fn completion_key(habit_id: &str, date: &str) -> String {
    format!("{habit_id}@{date}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid date '{0}': expected YYYY-MM-DD")]
pub struct InvalidDay(pub String);

/// Validates a calendar day and returns it in canonical `YYYY-MM-DD` form.
pub fn parse_day(raw: &str) -> Result<String, InvalidDay> {
    let format = format_description!("[year]-[month]-[day]");
    let date =
        Date::parse(raw.trim(), &format).map_err(|_| InvalidDay(raw.to_string()))?;
    date.format(&format).map_err(|_| InvalidDay(raw.to_string()))
}

/// Calendar day (UTC) an instant falls on.
pub fn day_of(instant: OffsetDateTime) -> String {
    let date = instant.to_offset(UtcOffset::UTC).date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::{completion_key, day_of, parse_day, Habit};
    use crate::domain::Category;

    #[test]
    fn parse_day_accepts_calendar_days_only() {
        assert_eq!(parse_day("2024-03-01").unwrap(), "2024-03-01");
        assert_eq!(parse_day(" 2024-02-29 ").unwrap(), "2024-02-29");
        assert!(parse_day("2023-02-29").is_err());
        assert!(parse_day("03/01/2024").is_err());
    }

    #[test]
    fn day_of_uses_utc_calendar_day() {
        assert_eq!(day_of(datetime!(2024-03-01 23:30 -02:00)), "2024-03-02");
        assert_eq!(day_of(datetime!(2024-03-01 00:00 UTC)), "2024-03-01");
    }

    #[test]
    fn completion_key_joins_habit_and_day() {
        assert_eq!(completion_key("h1", "2024-01-01"), "h1@2024-01-01");
    }

    #[test]
    fn habit_payload_omits_missing_goal() {
        let habit = Habit {
            id: "h1".to_string(),
            name: "Read".to_string(),
            category: Category::Learning,
            is_goal: false,
            goal_id: None,
            created_at: "2024-03-01T00:00:00Z".to_string(),
            updated_at: "2024-03-01T00:00:00Z".to_string(),
        };
        let value = serde_json::to_value(&habit).unwrap();
        assert!(value.get("goal_id").is_none());
        assert_eq!(value["category"], "learning");
    }
}
