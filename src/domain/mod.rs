pub mod category;
pub mod entity;
pub mod habit;
pub mod routine;

pub use category::Category;
pub use entity::{EntityType, OutboxOp};
pub use habit::{day_of, parse_day, Completion, Habit, HabitDraft, InvalidDay};
pub use routine::{Routine, RoutineDraft, RoutineStep};
