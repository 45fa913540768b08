use std::io::{self, IsTerminal};

use crate::app::{AppStatus, DayEntry};
use crate::db::OutboxEntry;
use crate::domain::{Habit, Routine};
use crate::sync::PassOutcome;

pub fn print_habit_list(habits: &[Habit]) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Habits"));
    if habits.is_empty() {
        println!("{}", palette.dim("no habits yet"));
        return;
    }
    for (depth, habit) in goal_tree(habits) {
        println!("{}", format_habit_row(habit, depth, &palette));
    }
    println!("{}", palette.dim(&format!("{} habit(s)", habits.len())));
}

pub fn print_habit(habit: &Habit) {
    let palette = Palette::auto();
    println!("{}", format_habit_row(habit, 0, &palette));
    if let Some(goal_id) = habit.goal_id.as_deref() {
        println!("  goal: {}", palette.id(goal_id));
    }
    println!("{}", palette.dim(&format!("  created {}", habit.created_at)));
    println!("{}", palette.dim(&format!("  updated {}", habit.updated_at)));
}

pub fn print_day(date: &str, entries: &[DayEntry]) {
    let palette = Palette::auto();
    println!("{}", palette.heading(date));
    if entries.is_empty() {
        println!("{}", palette.dim("no habits yet"));
        return;
    }
    for entry in entries {
        let mark = if entry.done {
            palette.paint("32", "[x]")
        } else {
            palette.dim("[ ]")
        };
        println!(
            "{mark} {} {} {}",
            palette.id(&entry.habit_id),
            entry.name,
            palette.category(entry.category.as_str())
        );
    }
    let done = entries.iter().filter(|entry| entry.done).count();
    println!("{}", palette.dim(&format!("{done}/{} done", entries.len())));
}

pub fn print_routines(routines: &[Routine]) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Routines"));
    if routines.is_empty() {
        println!("{}", palette.dim("no routines yet"));
        return;
    }
    for routine in routines {
        println!("{} {}", palette.id(&routine.id), routine.name);
        for (index, step) in routine.steps.iter().enumerate() {
            let mut line = format!("  {}. {}", index + 1, step.habit_id);
            if step.focus_mode {
                line.push_str(" focus");
            }
            if let Some(secs) = step.duration_secs {
                line.push_str(&format!(" {secs}s"));
            }
            println!("{line}");
        }
    }
}

pub fn print_status(status: &AppStatus) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Sync status"));
    let who = if status.signed_in {
        status.owner_id.clone()
    } else {
        format!("{} (signed out)", status.owner_id)
    };
    println!("owner:     {who}");
    println!("mode:      {}", status.mode);
    if let Some(db_path) = status.db_path.as_deref() {
        println!("database:  {db_path}");
    }
    if let Some(url) = status.remote_url.as_deref() {
        println!("remote:    {url}");
    }
    println!("phase:     {}", status.phase.as_str());
    println!(
        "last sync: {}",
        status.last_sync_at.as_deref().unwrap_or("never")
    );
    println!("pending:   {}", status.pending);
    if let Some(err) = status.last_error.as_deref() {
        println!("{}", palette.paint("31", &format!("last error: {err}")));
    }
}

pub fn print_outbox(entries: &[OutboxEntry]) {
    let palette = Palette::auto();
    if entries.is_empty() {
        println!("{}", palette.dim("outbox is empty"));
        return;
    }
    for entry in entries {
        let mut line = format!(
            "{:>4} {} {} {}",
            entry.seq,
            entry.op.as_str(),
            entry.entity_type,
            palette.id(&entry.entity_id)
        );
        if entry.attempts > 0 {
            line.push_str(&palette.dim(&format!(" attempts={}", entry.attempts)));
        }
        if entry.rejected {
            line.push_str(&palette.paint("1;31", " rejected"));
        }
        if let Some(err) = entry.last_error.as_deref() {
            line.push(' ');
            line.push_str(&palette.paint("31", err));
        }
        println!("{line}");
    }
}

pub fn print_sync_outcome(outcome: &PassOutcome) {
    let palette = Palette::auto();
    match outcome {
        PassOutcome::Coalesced => println!("{}", palette.dim("a sync pass is already running")),
        PassOutcome::Completed(summary) => {
            println!(
                "pulled {} (applied {}, deleted {}, kept local {}), pushed {}, failed {}",
                summary.pulled,
                summary.applied,
                summary.deleted,
                summary.kept_local,
                summary.pushed,
                summary.failed
            );
            if summary.parked > 0 {
                println!(
                    "{}",
                    palette.dim(&format!(
                        "{} rejected change(s) parked until edited",
                        summary.parked
                    ))
                );
            }
            if summary.waiting > 0 {
                println!(
                    "{}",
                    palette.dim(&format!(
                        "{} completion(s) wait for their habit and will be fetched again",
                        summary.waiting
                    ))
                );
            }
            for err in &summary.errors {
                println!("{}", palette.paint("31", err));
            }
        }
    }
}

/// Goals and standalone habits in name order, each goal followed by its
/// children. Children whose goal is missing are listed at the top level.
fn goal_tree(habits: &[Habit]) -> Vec<(usize, &Habit)> {
    let is_root = |habit: &Habit| match habit.goal_id.as_deref() {
        Some(goal_id) => !habits.iter().any(|other| other.id == goal_id),
        None => true,
    };
    let mut roots: Vec<&Habit> = habits.iter().filter(|habit| is_root(habit)).collect();
    roots.sort_by(|left, right| left.name.cmp(&right.name));

    let mut rows = Vec::with_capacity(habits.len());
    for root in roots {
        rows.push((0, root));
        let mut children: Vec<&Habit> = habits
            .iter()
            .filter(|habit| habit.goal_id.as_deref() == Some(root.id.as_str()))
            .collect();
        children.sort_by(|left, right| left.name.cmp(&right.name));
        rows.extend(children.into_iter().map(|child| (1, child)));
    }
    rows
}

fn format_habit_row(habit: &Habit, depth: usize, palette: &Palette) -> String {
    let indent = if depth == 0 {
        String::new()
    } else {
        palette.dim(&format!("{}↳ ", "  ".repeat(depth - 1)))
    };
    let mut line = format!(
        "{indent}{} {} {}",
        palette.id(&habit.id),
        habit.name,
        palette.category(habit.category.as_str())
    );
    if habit.is_goal {
        line.push(' ');
        line.push_str(&palette.paint("1;33", "[GOAL]"));
    }
    line
}

struct Palette {
    enabled: bool,
}

impl Palette {
    fn auto() -> Self {
        let enabled = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
        Self { enabled }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn heading(&self, text: &str) -> String {
        self.paint("1;36", text)
    }

    fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    fn id(&self, text: &str) -> String {
        self.paint("1;94", text)
    }

    fn category(&self, category: &str) -> String {
        self.paint("35", &format!("({category})"))
    }
}

#[cfg(test)]
mod tests {
    use super::{format_habit_row, goal_tree, Palette};
    use crate::domain::{Category, Habit};

    fn habit(id: &str, name: &str, goal_id: Option<&str>) -> Habit {
        Habit {
            id: id.to_string(),
            name: name.to_string(),
            category: Category::Health,
            is_goal: goal_id.is_none() && id.starts_with('g'),
            goal_id: goal_id.map(str::to_string),
            created_at: "2024-03-01T08:00:00Z".to_string(),
            updated_at: "2024-03-01T08:00:00Z".to_string(),
        }
    }

    #[test]
    fn goal_tree_nests_children_under_their_goal() {
        let habits = vec![
            habit("h2", "Walk", Some("g1")),
            habit("h3", "Read", None),
            habit("g1", "Get fit", None),
            habit("h1", "Run", Some("g1")),
            habit("h4", "Orphan", Some("g-missing")),
        ];
        let rows: Vec<(usize, &str)> = goal_tree(&habits)
            .into_iter()
            .map(|(depth, habit)| (depth, habit.id.as_str()))
            .collect();
        assert_eq!(
            rows,
            vec![(0, "g1"), (1, "h1"), (1, "h2"), (0, "h4"), (0, "h3")]
        );
    }

    #[test]
    fn plain_rows_mark_goals_and_indent_children() {
        let palette = Palette { enabled: false };
        let goal = format_habit_row(&habit("g1", "Get fit", None), 0, &palette);
        assert_eq!(goal, "g1 Get fit (health) [GOAL]");
        let child = format_habit_row(&habit("h1", "Run", Some("g1")), 1, &palette);
        assert_eq!(child, "↳ h1 Run (health)");
    }
}
