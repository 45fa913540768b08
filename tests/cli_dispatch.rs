use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use mockito::Matcher;
use serde_json::{json, Value};
use uuid::Uuid;

fn unique_workspace(prefix: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::now_v7()));
    std::fs::create_dir_all(&path).expect("workspace should be creatable");
    path
}

fn habitsync(root: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_habitsync"));
    command.current_dir(root);
    for key in [
        "HABITSYNC_CONFIG",
        "HABITSYNC_DB",
        "HABITSYNC_REMOTE_URL",
        "HABITSYNC_API_KEY",
        "HABITSYNC_OWNER",
        "HABITSYNC_ACCESS_TOKEN",
        "HABITSYNC_SANDBOX",
    ] {
        command.env_remove(key);
    }
    command
}

fn run_habitsync(root: &Path, db_path: &Path, args: &[&str]) -> Output {
    habitsync(root)
        .arg("--db")
        .arg(db_path)
        .args(args)
        .output()
        .expect("habitsync command should run")
}

fn run_signed_in(root: &Path, db_path: &Path, remote_url: &str, args: &[&str]) -> Output {
    habitsync(root)
        .arg("--db")
        .arg(db_path)
        .args(["--remote-url", remote_url, "--api-key", "anon-key"])
        .args(["--owner", "u1", "--access-token", "token-1"])
        .args(args)
        .output()
        .expect("habitsync command should run")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success but failed.\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_failure(output: &Output) {
    assert!(
        !output.status.success(),
        "expected failure but command succeeded.\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn parse_json(output: &Output) -> Value {
    assert_success(output);
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

#[test]
fn signed_out_commands_track_habits_and_queue_changes() {
    let root = unique_workspace("habitsync-cli-local");
    let db = root.join("habits.sqlite");

    let added = run_habitsync(&root, &db, &["habit", "add", "Read", "-k", "learning", "--id", "h-read"]);
    assert_success(&added);
    assert!(String::from_utf8_lossy(&added.stdout).contains("created h-read Read"));

    let habits = parse_json(&run_habitsync(&root, &db, &["habit", "ls", "--json"]));
    assert_eq!(habits.as_array().map(Vec::len), Some(1));
    assert_eq!(habits[0]["category"], "learning");

    assert_success(&run_habitsync(&root, &db, &["done", "h-read", "--date", "2024-03-01"]));
    let day = parse_json(&run_habitsync(&root, &db, &["day", "--date", "2024-03-01", "--json"]));
    assert_eq!(day["date"], "2024-03-01");
    assert_eq!(day["habits"][0]["done"], true);

    let other_day = parse_json(&run_habitsync(&root, &db, &["day", "--date", "2024-03-02", "--json"]));
    assert_eq!(other_day["habits"][0]["done"], false);

    let outbox = parse_json(&run_habitsync(&root, &db, &["outbox", "--json"]));
    let kinds: Vec<&str> = outbox
        .as_array()
        .expect("outbox array")
        .iter()
        .filter_map(|entry| entry["entity_type"].as_str())
        .collect();
    assert_eq!(kinds, vec!["habit", "completion"]);

    let status = parse_json(&run_habitsync(&root, &db, &["status", "--json"]));
    assert_eq!(status["owner_id"], "local");
    assert_eq!(status["signed_in"], false);
    assert_eq!(status["pending"], 2);
    assert_eq!(status["mode"], "local only");

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn bad_input_fails_with_a_message() {
    let root = unique_workspace("habitsync-cli-errors");
    let db = root.join("habits.sqlite");

    let missing = run_habitsync(&root, &db, &["habit", "rm", "h-nope"]);
    assert_failure(&missing);
    assert!(String::from_utf8_lossy(&missing.stderr).contains("not found"));

    assert_success(&run_habitsync(&root, &db, &["habit", "add", "Run", "--id", "h-run"]));
    let bad_day = run_habitsync(&root, &db, &["done", "h-run", "--date", "2024-02-30"]);
    assert_failure(&bad_day);
    assert!(String::from_utf8_lossy(&bad_day.stderr).contains("invalid date"));

    let bad_goal = run_habitsync(&root, &db, &["habit", "add", "Walk", "--under", "h-run"]);
    assert_failure(&bad_goal);

    let no_remote = run_habitsync(&root, &db, &["sync"]);
    assert_failure(&no_remote);
    assert!(String::from_utf8_lossy(&no_remote.stderr).contains("sync needs"));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn goals_routines_and_cascading_deletes() {
    let root = unique_workspace("habitsync-cli-routines");
    let db = root.join("habits.sqlite");

    assert_success(&run_habitsync(&root, &db, &["habit", "add", "Get fit", "--goal", "--id", "g-fit"]));
    assert_success(&run_habitsync(&root, &db, &["habit", "add", "Run", "--under", "g-fit", "--id", "h-run"]));
    assert_success(&run_habitsync(
        &root,
        &db,
        &["routine", "save", "Morning", "--id", "r-am", "-s", "h-run:focus:600", "-s", "g-fit"],
    ));

    let routines = parse_json(&run_habitsync(&root, &db, &["routine", "ls", "--json"]));
    assert_eq!(routines[0]["steps"][0]["focus_mode"], true);
    assert_eq!(routines[0]["steps"][0]["duration_secs"], 600);

    assert_success(&run_habitsync(&root, &db, &["habit", "rm", "g-fit"]));
    let run = parse_json(&run_habitsync(&root, &db, &["habit", "show", "h-run", "--json"]));
    assert!(run.get("goal_id").is_none());
    let routines = parse_json(&run_habitsync(&root, &db, &["routine", "ls", "--json"]));
    assert_eq!(routines[0]["steps"].as_array().map(Vec::len), Some(1));

    let listing = run_habitsync(&root, &db, &["habit", "ls"]);
    assert_success(&listing);
    assert!(String::from_utf8_lossy(&listing.stdout).contains("1 habit(s)"));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn sync_pushes_the_outbox_to_the_remote() {
    let root = unique_workspace("habitsync-cli-sync");
    let db = root.join("habits.sqlite");
    let mut server = mockito::Server::new();
    let pulls = server
        .mock("GET", Matcher::Regex(r"^/rest/v1/(habits|completions|routines)\?".to_string()))
        .match_header("authorization", "Bearer token-1")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .expect(3)
        .create();
    let push = server
        .mock("POST", Matcher::Regex(r"^/rest/v1/habits\?".to_string()))
        .match_header("apikey", "anon-key")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(
            json!([{
                "id": "h-read",
                "data": {"id": "h-read", "name": "Read", "category": "learning"},
                "deleted": false,
                "updated_at": "2030-01-01T00:00:00Z"
            }])
            .to_string(),
        )
        .expect(1)
        .create();

    let url = server.url();
    assert_success(&run_signed_in(&root, &db, &url, &["habit", "add", "Read", "-k", "learning", "--id", "h-read"]));

    let outcome = parse_json(&run_signed_in(&root, &db, &url, &["sync", "--json"]));
    assert_eq!(outcome["outcome"], "completed");
    assert_eq!(outcome["pushed"], 1);
    pulls.assert();
    push.assert();

    let outbox = parse_json(&run_signed_in(&root, &db, &url, &["outbox", "--json"]));
    assert_eq!(outbox.as_array().map(Vec::len), Some(0));
    let status = parse_json(&run_signed_in(&root, &db, &url, &["status", "--json"]));
    assert_eq!(status["owner_id"], "u1");
    assert_eq!(status["mode"], "local-first with remote sync");
    assert!(status["last_sync_at"].is_string());
    let habit = parse_json(&run_signed_in(&root, &db, &url, &["habit", "show", "h-read", "--json"]));
    assert_eq!(habit["updated_at"], "2030-01-01T00:00:00Z");

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn rejected_token_fails_the_sync_and_keeps_the_outbox() {
    let root = unique_workspace("habitsync-cli-auth");
    let db = root.join("habits.sqlite");
    let mut server = mockito::Server::new();
    let _pulls = server
        .mock("GET", Matcher::Any)
        .with_status(401)
        .with_body("JWT expired")
        .create();

    let url = server.url();
    assert_success(&run_signed_in(&root, &db, &url, &["habit", "add", "Read", "--id", "h-read"]));
    let sync = run_signed_in(&root, &db, &url, &["sync"]);
    assert_failure(&sync);
    assert!(String::from_utf8_lossy(&sync.stderr).contains("authentication rejected"));

    let outbox = parse_json(&run_signed_in(&root, &db, &url, &["outbox", "--json"]));
    assert_eq!(outbox.as_array().map(Vec::len), Some(1));
    let status = parse_json(&run_signed_in(&root, &db, &url, &["status", "--json"]));
    assert!(status["last_sync_at"].is_null());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn watch_runs_background_passes_until_the_tick_count() {
    let root = unique_workspace("habitsync-cli-watch");
    let db = root.join("habits.sqlite");
    let mut server = mockito::Server::new();
    let _pulls = server
        .mock("GET", Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("[]")
        .create();

    let watch = run_signed_in(
        &root,
        &db,
        &server.url(),
        &["watch", "--ticks", "1", "--interval-secs", "1"],
    );
    assert_success(&watch);
    assert!(String::from_utf8_lossy(&watch.stdout).contains("pass 1: pulled 0, pushed 0"));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn init_writes_a_starter_config_once() {
    let root = unique_workspace("habitsync-cli-init");
    let db = root.join("data/habits.sqlite");
    let config = root.join("config.toml");

    let first = habitsync(&root)
        .arg("--db")
        .arg(&db)
        .arg("--config")
        .arg(&config)
        .arg("init")
        .output()
        .expect("init should run");
    assert_success(&first);
    assert!(db.exists());
    let raw = std::fs::read_to_string(&config).expect("starter config");
    assert!(raw.contains("[sync]"));

    let init = run_habitsync(&root, &db, &["init"]);
    assert_success(&init);
    assert!(root.join(".habitsync/config.toml").exists());

    let again = run_habitsync(&root, &db, &["init"]);
    assert_success(&again);
    assert!(String::from_utf8_lossy(&again.stdout).contains("already exists"));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn unusable_database_falls_back_to_memory() {
    let root = unique_workspace("habitsync-cli-fallback");
    let status = parse_json(&run_habitsync(&root, &root, &["status", "--json"]));
    assert_eq!(status["mode"], "volatile memory only");
    assert_eq!(status["durable"], false);

    let sandboxed = habitsync(&root)
        .env("HABITSYNC_SANDBOX", "1")
        .args(["habit", "add", "Read"])
        .output()
        .expect("command should run");
    assert_success(&sandboxed);
    assert!(!root.join(".habitsync/habits.sqlite").exists());

    let _ = std::fs::remove_dir_all(root);
}
