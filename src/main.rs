mod app;
mod capabilities;
mod cli;
mod clock;
mod config;
mod db;
mod domain;
mod events;
mod ids;
mod init;
mod remote;
mod session;
mod store;
mod sync;
mod ui;

use std::time::Duration;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("json serialization should work")
    );
}

/// Logs go to stderr so `--json` output stays machine readable.
fn init_tracing(default_level: LevelFilter) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run() -> Result<(), app::AppError> {
    use app::{App, HabitPatch, OpenOptions};
    use clap::Parser;
    use cli::{Commands, HabitSubcommands, RoutineSubcommands};
    use domain::{HabitDraft, RoutineDraft};
    use store::SignOutPolicy;

    let cli = cli::Cli::parse();
    let watching = matches!(cli.command, Commands::Watch(_));
    init_tracing(if watching {
        LevelFilter::INFO
    } else {
        LevelFilter::WARN
    });

    let overrides = config::Overrides {
        db_path: cli.db.clone(),
        remote_url: cli.remote_url.clone(),
        api_key: cli.api_key.clone(),
    };
    let initializing = matches!(cli.command, Commands::Init);
    // `init` may be the command that creates the named config file.
    let config_path = cli
        .config
        .as_deref()
        .filter(|path| !initializing || path.exists());
    let config = config::Config::load(config_path, overrides)?;

    if initializing {
        init::init_all(cli.config.as_deref(), &config.db_path)?;
        println!("habitsync init completed");
        return Ok(());
    }

    let session = match (cli.owner, cli.access_token) {
        (Some(owner), Some(token)) => Some(session::Session::new(owner, token)),
        _ => None,
    };
    let mut app = App::open(
        config,
        session,
        OpenOptions {
            initial_sync: watching,
        },
    )?;

    match cli.command {
        Commands::Init => {}
        Commands::Habit(args) => match args.command {
            HabitSubcommands::Add(args) => {
                let mut draft = HabitDraft::new(args.name, args.category);
                draft.id = args.id;
                draft.is_goal = args.goal;
                draft.goal_id = args.goal_id;
                let habit = app.add_habit(draft)?;
                println!("created {} {}", habit.id, habit.name);
            }
            HabitSubcommands::Ls(args) => {
                let habits = app.list_habits()?;
                if args.json {
                    print_json(&habits);
                } else {
                    ui::print_habit_list(&habits);
                }
            }
            HabitSubcommands::Show(args) => {
                let habit = app
                    .show_habit(&args.id)?
                    .ok_or_else(|| app::AppError::NotFound(format!("habit '{}'", args.id)))?;
                if args.json {
                    print_json(&habit);
                } else {
                    ui::print_habit(&habit);
                }
            }
            HabitSubcommands::Edit(args) => {
                let is_goal = match (args.goal, args.not_goal) {
                    (true, _) => Some(true),
                    (_, true) => Some(false),
                    _ => None,
                };
                let goal_id = match (args.goal_id, args.detach) {
                    (Some(goal_id), _) => Some(Some(goal_id)),
                    (None, true) => Some(None),
                    (None, false) => None,
                };
                let habit = app.edit_habit(
                    &args.id,
                    HabitPatch {
                        name: args.name,
                        category: args.category,
                        is_goal,
                        goal_id,
                    },
                )?;
                println!("updated {} {}", habit.id, habit.name);
            }
            HabitSubcommands::Rm(args) => {
                app.remove_habit(&args.id)?;
                println!("deleted {}", args.id);
            }
        },
        Commands::Done(args) => {
            let completion = app.set_done(&args.habit, args.date.as_deref(), !args.undo)?;
            let state = if completion.done { "done" } else { "not done" };
            println!("{} {} on {}", completion.habit_id, state, completion.date);
        }
        Commands::Day(args) => {
            let (date, entries) = app.day(args.date.as_deref())?;
            if args.json {
                print_json(&serde_json::json!({ "date": date, "habits": entries }));
            } else {
                ui::print_day(&date, &entries);
            }
        }
        Commands::Routine(args) => match args.command {
            RoutineSubcommands::Save(args) => {
                let draft = RoutineDraft {
                    id: args.id,
                    name: args.name,
                    steps: args.steps,
                };
                let routine = app.save_routine(draft)?;
                println!(
                    "saved {} {} ({} step(s))",
                    routine.id,
                    routine.name,
                    routine.steps.len()
                );
            }
            RoutineSubcommands::Ls(args) => {
                let routines = app.list_routines()?;
                if args.json {
                    print_json(&routines);
                } else {
                    ui::print_routines(&routines);
                }
            }
            RoutineSubcommands::Rm(args) => {
                app.remove_routine(&args.id)?;
                println!("deleted {}", args.id);
            }
        },
        Commands::Sync(args) => {
            let outcome = app.sync()?;
            if args.json {
                print_json(&outcome);
            } else {
                ui::print_sync_outcome(&outcome);
            }
        }
        Commands::Watch(args) => {
            let inbox = app.subscribe();
            let interval = args.interval_secs.map(Duration::from_secs);
            app.start_sync_service(interval)?;
            let mut passes = 0u64;
            while args.ticks.map_or(true, |ticks| passes < ticks) {
                let Ok(event) = inbox.recv() else {
                    break;
                };
                match event {
                    events::DomainEvent::SyncCompleted {
                        pulled,
                        pushed,
                        failed,
                        ..
                    } => {
                        passes += 1;
                        println!("pass {passes}: pulled {pulled}, pushed {pushed}, failed {failed}");
                    }
                    events::DomainEvent::SyncFailed {
                        entity: None,
                        message,
                        ..
                    } => {
                        passes += 1;
                        println!("pass {passes}: failed: {message}");
                    }
                    _ => {}
                }
            }
            app.teardown();
        }
        Commands::Status(args) => {
            let status = app.status()?;
            if args.json {
                print_json(&status);
            } else {
                ui::print_status(&status);
            }
        }
        Commands::Outbox(args) => {
            let entries = app.outbox()?;
            if args.json {
                print_json(&entries);
            } else {
                ui::print_outbox(&entries);
            }
        }
        Commands::Signout(args) => {
            let policy = if args.purge {
                SignOutPolicy::Purge
            } else {
                SignOutPolicy::Retain
            };
            match app.sign_out(policy)? {
                Some(owner) => println!("signed out {owner}"),
                None => println!("no session to sign out"),
            }
        }
    }
    Ok(())
}
