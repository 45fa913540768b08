use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use super::{App, AppError, HabitPatch, OpenOptions};
use crate::capabilities::Capabilities;
use crate::clock::{Clock, ManualClock};
use crate::config::{Config, RemoteConfig};
use crate::domain::{Category, EntityType, HabitDraft, RoutineDraft};
use crate::remote::memory::MemoryRemote;
use crate::remote::RemoteStore;
use crate::session::{Session, LOCAL_OWNER};
use crate::store::{SignOutPolicy, StoreError};
use crate::sync::PassOutcome;

fn unique_workspace() -> PathBuf {
    let root = std::env::temp_dir().join(format!("habitsync-app-test-{}", Uuid::now_v7()));
    std::fs::create_dir_all(&root).expect("temp workspace should be creatable");
    root
}

fn config_at(db_path: PathBuf, with_remote: bool) -> Config {
    Config {
        db_path: db_path.to_str().expect("utf8 path").to_string(),
        remote: with_remote.then(|| RemoteConfig {
            url: "https://example.invalid".to_string(),
            api_key: None,
            timeout: Duration::from_secs(5),
        }),
        sync_interval: Duration::from_secs(30),
        background_sync: true,
    }
}

fn open(
    config: Config,
    remote: Option<Arc<MemoryRemote>>,
    session: Option<Session>,
    options: OpenOptions,
) -> App {
    let capabilities = Capabilities::from_parts(&config, true);
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at("2024-03-01T08:00:00Z"));
    let remote = remote.map(|remote| remote as Arc<dyn RemoteStore>);
    App::assemble(config, capabilities, remote, session, clock, options).expect("app should open")
}

#[test]
fn signed_out_app_works_locally_and_queues_changes() {
    let root = unique_workspace();
    let app = open(
        config_at(root.join("habits.sqlite"), false),
        None,
        None,
        OpenOptions::default(),
    );
    assert_eq!(app.owner(), LOCAL_OWNER);
    assert!(app.store().is_durable());

    let habit = app
        .add_habit(HabitDraft::new("Read", Category::Learning))
        .expect("add should succeed");
    let completion = app
        .set_done(&habit.id, None, true)
        .expect("completion should be recorded");
    assert_eq!(completion.date, "2024-03-01");

    let (day, entries) = app.day(None).expect("day view");
    assert_eq!(day, "2024-03-01");
    assert_eq!(entries.len(), 1);
    assert!(entries[0].done);

    assert_eq!(app.outbox().expect("outbox").len(), 2);
    let status = app.status().expect("status");
    assert_eq!(status.pending, 2);
    assert_eq!(status.mode, "local only");
    assert!(!status.signed_in);

    assert!(matches!(app.sync(), Err(AppError::Unavailable(_))));
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn edit_requires_a_change_and_keeps_untouched_fields() {
    let root = unique_workspace();
    let app = open(
        config_at(root.join("habits.sqlite"), false),
        None,
        None,
        OpenOptions::default(),
    );
    let goal = app
        .add_habit(HabitDraft::new("Run a marathon", Category::Health).as_goal())
        .expect("goal");
    let habit = app
        .add_habit(HabitDraft::new("Run", Category::Health))
        .expect("habit");

    let empty = app.edit_habit(&habit.id, HabitPatch::default());
    assert!(matches!(empty, Err(AppError::InvalidArgument(_))));

    let edited = app
        .edit_habit(
            &habit.id,
            HabitPatch {
                goal_id: Some(Some(goal.id.clone())),
                ..HabitPatch::default()
            },
        )
        .expect("edit");
    assert_eq!(edited.name, "Run");
    assert_eq!(edited.goal_id.as_deref(), Some(goal.id.as_str()));

    let missing = app.edit_habit(
        "h-missing",
        HabitPatch {
            name: Some("x".to_string()),
            ..HabitPatch::default()
        },
    );
    assert!(matches!(missing, Err(AppError::NotFound(_))));
    assert!(matches!(app.remove_habit("h-missing"), Err(AppError::NotFound(_))));
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn sign_in_adopts_local_rows_and_startup_sync_pushes_them() {
    let root = unique_workspace();
    let db_path = root.join("habits.sqlite");
    let offline = open(
        config_at(db_path.clone(), false),
        None,
        None,
        OpenOptions::default(),
    );
    let habit = offline
        .add_habit(HabitDraft::new("Read", Category::Learning))
        .expect("add");
    offline.teardown();

    let remote = Arc::new(MemoryRemote::new("2024-03-01T09:00:00Z"));
    let app = open(
        config_at(db_path, true),
        Some(remote.clone()),
        Some(Session::new("u1", "token-1")),
        OpenOptions { initial_sync: true },
    );
    assert_eq!(app.owner(), "u1");
    assert_eq!(
        remote.live_ids("u1", EntityType::Habit),
        vec![habit.id.clone()]
    );
    let status = app.status().expect("status");
    assert_eq!(status.pending, 0);
    assert_eq!(status.last_sync_at.as_deref(), Some("2024-03-01T08:00:00Z"));
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn explicit_sync_pulls_rows_from_other_devices() {
    let root = unique_workspace();
    let remote = Arc::new(MemoryRemote::new("2024-03-01T09:00:00Z"));
    remote.seed(
        "u1",
        EntityType::Habit,
        "h-remote",
        json!({
            "id": "h-remote",
            "name": "Stretch",
            "category": "health",
            "is_goal": false,
            "created_at": "2024-02-28T10:00:00Z",
            "updated_at": "2024-02-28T10:00:00Z"
        }),
        "2024-02-28T10:00:00Z",
    );
    let app = open(
        config_at(root.join("habits.sqlite"), true),
        Some(remote),
        Some(Session::new("u1", "token-1")),
        OpenOptions::default(),
    );
    assert!(app.list_habits().expect("list").is_empty());

    match app.sync().expect("sync") {
        PassOutcome::Completed(summary) => assert_eq!(summary.applied, 1),
        PassOutcome::Coalesced => panic!("nothing else is syncing"),
    }
    let habits = app.list_habits().expect("list");
    assert_eq!(habits.len(), 1);
    assert_eq!(habits[0].name, "Stretch");
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn unusable_database_path_falls_back_to_the_volatile_store() {
    let root = unique_workspace();
    let app = open(config_at(root.clone(), false), None, None, OpenOptions::default());
    assert!(!app.capabilities().local_store);
    assert!(!app.store().is_durable());
    assert_eq!(app.status().expect("status").mode, "volatile memory only");

    let habit = app
        .add_habit(HabitDraft::new("Read", Category::Learning))
        .expect("volatile store still accepts writes");
    app.save_routine(RoutineDraft::new("Morning").step(habit.id.clone(), true, Some(600)))
        .expect("routine");
    assert_eq!(app.list_routines().expect("routines").len(), 1);
    assert!(app.outbox().expect("outbox").is_empty());

    let mut app = app;
    assert!(matches!(
        app.start_sync_service(None),
        Err(AppError::Unavailable(_))
    ));
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn sign_out_purge_removes_the_owner_rows() {
    let root = unique_workspace();
    let remote = Arc::new(MemoryRemote::new("2024-03-01T09:00:00Z"));
    remote.set_offline(true);
    let app = open(
        config_at(root.join("habits.sqlite"), true),
        Some(remote),
        Some(Session::new("u1", "token-1")),
        OpenOptions::default(),
    );
    app.add_habit(HabitDraft::new("Read", Category::Learning))
        .expect("add");

    let signed_out = app.sign_out(SignOutPolicy::Purge).expect("sign out");
    assert_eq!(signed_out.as_deref(), Some("u1"));
    assert_eq!(app.owner(), LOCAL_OWNER);
    assert!(app.list_habits().expect("list").is_empty());
    assert_eq!(app.sign_out(SignOutPolicy::Retain).expect("noop"), None);
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn sync_service_starts_once_and_tears_down() {
    let root = unique_workspace();
    let remote = Arc::new(MemoryRemote::new("2024-03-01T09:00:00Z"));
    let mut app = open(
        config_at(root.join("habits.sqlite"), true),
        Some(remote),
        Some(Session::new("u1", "token-1")),
        OpenOptions::default(),
    );
    app.start_sync_service(Some(Duration::from_secs(3600)))
        .expect("service should start")
        .pause();
    app.start_sync_service(None).expect("second start reuses the service");
    app.teardown();
    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn invalid_days_surface_as_store_errors() {
    let root = unique_workspace();
    let app = open(
        config_at(root.join("habits.sqlite"), false),
        None,
        None,
        OpenOptions::default(),
    );
    let err = app.day(Some("2024-13-01")).expect_err("month 13");
    assert!(matches!(err, AppError::Store(StoreError::InvalidDay(_))));
    let _ = std::fs::remove_dir_all(root);
}
