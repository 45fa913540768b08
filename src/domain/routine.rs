use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineStep {
    pub habit_id: String,
    #[serde(default)]
    pub focus_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routine {
    pub id: String,
    pub name: String,
    pub steps: Vec<RoutineStep>,
    pub created_at: String,
    pub updated_at: String,
}

impl Routine {
    pub fn references(&self, habit_id: &str) -> bool {
        self.steps.iter().any(|step| step.habit_id == habit_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutineDraft {
    pub id: Option<String>,
    pub name: String,
    pub steps: Vec<RoutineStep>,
}

impl RoutineDraft {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn step(mut self, habit_id: impl Into<String>, focus_mode: bool, duration_secs: Option<u32>) -> Self {
        self.steps.push(RoutineStep {
            habit_id: habit_id.into(),
            focus_mode,
            duration_secs,
        });
        self
    }
}
