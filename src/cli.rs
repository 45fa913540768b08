use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Args, Parser, Subcommand};

use crate::domain::{Category, RoutineStep};

fn cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::BrightYellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::BrightMagenta.on_default())
}

#[derive(Debug, Parser)]
#[command(name = "habitsync")]
#[command(bin_name = "habitsync")]
#[command(version)]
#[command(about = "A local-first habit tracker that syncs when it can")]
#[command(styles = cli_styles())]
pub struct Cli {
    #[arg(
        short = 'c',
        long,
        env = "HABITSYNC_CONFIG",
        help = "Path to a config.toml (defaults to .habitsync/config.toml when present)."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'd',
        long,
        env = "HABITSYNC_DB",
        help = "Path to the local SQLite database."
    )]
    pub db: Option<String>,

    #[arg(
        long,
        env = "HABITSYNC_REMOTE_URL",
        help = "Base URL of the remote REST endpoint."
    )]
    pub remote_url: Option<String>,

    #[arg(
        long,
        env = "HABITSYNC_API_KEY",
        hide_env_values = true,
        help = "API key sent with every remote request."
    )]
    pub api_key: Option<String>,

    #[arg(
        long,
        env = "HABITSYNC_OWNER",
        requires = "access_token",
        help = "Signed-in user id; omit to work signed out."
    )]
    pub owner: Option<String>,

    #[arg(
        long,
        env = "HABITSYNC_ACCESS_TOKEN",
        hide_env_values = true,
        requires = "owner",
        help = "Bearer token for the signed-in user."
    )]
    pub access_token: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create the local database and a starter config.")]
    Init,
    #[command(about = "Manage habits and goals.")]
    Habit(HabitArgs),
    #[command(about = "Mark a habit done (or not done) for a day.")]
    Done(DoneArgs),
    #[command(about = "Show every habit and whether it is done for a day.")]
    Day(DayArgs),
    #[command(about = "Manage routines.")]
    Routine(RoutineArgs),
    #[command(about = "Pull remote changes then push the outbox.")]
    Sync(OutputArgs),
    #[command(about = "Run background sync until interrupted or a tick count is reached.")]
    Watch(WatchArgs),
    #[command(about = "Show sync status for the active owner.")]
    Status(OutputArgs),
    #[command(about = "List changes waiting to be pushed.")]
    Outbox(OutputArgs),
    #[command(about = "End the session and optionally purge that user's local rows.")]
    Signout(SignoutArgs),
}

#[derive(Debug, Args)]
pub struct OutputArgs {
    #[arg(long, help = "Print JSON instead of text.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct HabitArgs {
    #[command(subcommand)]
    pub command: HabitSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum HabitSubcommands {
    #[command(about = "Add a habit.")]
    Add(HabitAddArgs),
    #[command(about = "List habits, goals first with their children indented.")]
    Ls(OutputArgs),
    #[command(about = "Show one habit.")]
    Show(HabitShowArgs),
    #[command(about = "Change fields on a habit.")]
    Edit(HabitEditArgs),
    #[command(about = "Delete a habit and detach everything that points at it.")]
    Rm(IdArgs),
}

#[derive(Debug, Args)]
pub struct HabitAddArgs {
    #[arg(help = "Habit name.")]
    pub name: String,

    #[arg(
        short = 'k',
        long,
        default_value = "misc",
        value_parser = parse_category,
        help = "Category such as health, fitness, learning or misc."
    )]
    pub category: Category,

    #[arg(long, help = "Mark the habit as a goal other habits can roll up into.")]
    pub goal: bool,

    #[arg(long = "under", help = "Id of the goal this habit belongs to.")]
    pub goal_id: Option<String>,

    #[arg(long, help = "Use this id instead of generating one.")]
    pub id: Option<String>,
}

#[derive(Debug, Args)]
pub struct HabitShowArgs {
    #[arg(help = "Habit id.")]
    pub id: String,

    #[arg(long, help = "Print JSON instead of text.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct HabitEditArgs {
    #[arg(help = "Habit id.")]
    pub id: String,

    #[arg(long, help = "New name.")]
    pub name: Option<String>,

    #[arg(short = 'k', long, value_parser = parse_category, help = "New category.")]
    pub category: Option<Category>,

    #[arg(long, conflicts_with = "not_goal", help = "Make the habit a goal.")]
    pub goal: bool,

    #[arg(long, help = "Make the habit a plain habit.")]
    pub not_goal: bool,

    #[arg(long = "under", conflicts_with = "detach", help = "Attach to a goal.")]
    pub goal_id: Option<String>,

    #[arg(long, help = "Detach from its goal.")]
    pub detach: bool,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(help = "Id to act on.")]
    pub id: String,
}

#[derive(Debug, Args)]
pub struct DoneArgs {
    #[arg(help = "Habit id.")]
    pub habit: String,

    #[arg(long, help = "Day as YYYY-MM-DD (defaults to today, UTC).")]
    pub date: Option<String>,

    #[arg(long, help = "Record the habit as not done.")]
    pub undo: bool,
}

#[derive(Debug, Args)]
pub struct DayArgs {
    #[arg(long, help = "Day as YYYY-MM-DD (defaults to today, UTC).")]
    pub date: Option<String>,

    #[arg(long, help = "Print JSON instead of text.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct RoutineArgs {
    #[command(subcommand)]
    pub command: RoutineSubcommands,
}

#[derive(Debug, Subcommand)]
pub enum RoutineSubcommands {
    #[command(about = "Create or replace a routine.")]
    Save(RoutineSaveArgs),
    #[command(about = "List routines.")]
    Ls(OutputArgs),
    #[command(about = "Delete a routine.")]
    Rm(IdArgs),
}

#[derive(Debug, Args)]
pub struct RoutineSaveArgs {
    #[arg(help = "Routine name.")]
    pub name: String,

    #[arg(
        short = 's',
        long = "step",
        value_parser = parse_step,
        help = "Step as habit[:focus][:seconds]; repeat in order."
    )]
    pub steps: Vec<RoutineStep>,

    #[arg(long, help = "Replace the routine with this id.")]
    pub id: Option<String>,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    #[arg(long, help = "Seconds between passes (defaults to the configured interval).")]
    pub interval_secs: Option<u64>,

    #[arg(long, help = "Exit after this many passes.")]
    pub ticks: Option<u64>,
}

#[derive(Debug, Args)]
pub struct SignoutArgs {
    #[arg(long, help = "Delete the user's local rows and pending changes.")]
    pub purge: bool,
}

fn parse_category(raw: &str) -> Result<Category, String> {
    raw.parse::<Category>().map_err(|err| err.to_string())
}

/// `habit`, `habit:focus`, `habit:300` or `habit:focus:300`.
fn parse_step(raw: &str) -> Result<RoutineStep, String> {
    let mut parts = raw.split(':');
    let habit_id = parts
        .next()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| format!("step '{raw}' is missing a habit id"))?;
    let mut focus_mode = false;
    let mut duration_secs = None;
    for part in parts {
        match part.trim() {
            "focus" if !focus_mode && duration_secs.is_none() => focus_mode = true,
            secs if duration_secs.is_none() => {
                let value = secs
                    .parse::<u32>()
                    .map_err(|_| format!("step '{raw}': '{secs}' is not focus or a number of seconds"))?;
                duration_secs = Some(value);
            }
            _ => return Err(format!("step '{raw}' has too many parts")),
        }
    }
    Ok(RoutineStep {
        habit_id: habit_id.to_string(),
        focus_mode,
        duration_secs,
    })
}
