use std::io::{self, Write};
use std::path::Path;

use crate::app::AppError;
use crate::config::{DEFAULT_CONFIG_PATH, DEFAULT_INTERVAL_SECS};
use crate::db;

const ANSI_RESET: &str = "\x1b[0m";
const ANSI_BOLD_CYAN: &str = "\x1b[1;36m";
const ANSI_BOLD_GREEN: &str = "\x1b[1;32m";
const ANSI_BOLD_YELLOW: &str = "\x1b[1;33m";

pub(crate) fn init_all(config_path: Option<&Path>, db_path: &str) -> Result<(), AppError> {
    progress(&format!("opening local database at {db_path}"))?;
    init_local_store(db_path)?;
    progress_ok("local store ready")?;

    let config_path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
    if write_starter_config(config_path, db_path)? {
        progress_ok(&format!("wrote starter config to {}", config_path.display()))?;
    } else {
        progress_warn(&format!(
            "config {} already exists; left untouched",
            config_path.display()
        ))?;
    }
    Ok(())
}

pub(crate) fn init_local_store(db_path: &str) -> Result<(), AppError> {
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let _ = db::open_connection(db_path).map_err(crate::store::StoreError::from)?;
    Ok(())
}

/// Returns false when a config is already present.
pub(crate) fn write_starter_config(path: &Path, db_path: &str) -> Result<bool, AppError> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, starter_config(db_path))?;
    Ok(true)
}

fn starter_config(db_path: &str) -> String {
    let db_path = toml::Value::String(db_path.to_string());
    format!(
        "[store]\npath = {db_path}\n\n\
         # [remote]\n# url = \"https://<project>.example.com/rest/v1\"\n# api_key = \"...\"\n# timeout_secs = 10\n\n\
         [sync]\ninterval_secs = {DEFAULT_INTERVAL_SECS}\nbackground = true\n"
    )
}

fn progress(message: &str) -> Result<(), AppError> {
    println!("{ANSI_BOLD_CYAN}•{ANSI_RESET} {message}");
    io::stdout().flush()?;
    Ok(())
}

fn progress_ok(message: &str) -> Result<(), AppError> {
    println!("{ANSI_BOLD_GREEN}✓{ANSI_RESET} {message}");
    io::stdout().flush()?;
    Ok(())
}

fn progress_warn(message: &str) -> Result<(), AppError> {
    println!("{ANSI_BOLD_YELLOW}!{ANSI_RESET} {message}");
    io::stdout().flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::{init_local_store, starter_config, write_starter_config};
    use crate::config::{Config, Overrides};

    #[test]
    fn starter_config_parses_and_points_at_the_database() {
        let config = Config::from_toml(&starter_config("data/h.sqlite"), Overrides::default())
            .expect("starter config should parse");
        assert_eq!(config.db_path, "data/h.sqlite");
        assert!(config.remote.is_none());
        assert!(config.background_sync);
    }

    #[test]
    fn init_creates_the_database_and_never_overwrites_config() {
        let root = std::env::temp_dir().join(format!("habitsync-init-test-{}", Uuid::now_v7()));
        let db_path = root.join("nested/habits.sqlite");
        let db_path = db_path.to_str().expect("utf8 path");
        init_local_store(db_path).expect("init should create parents");
        assert!(std::path::Path::new(db_path).exists());

        let config_path = root.join("config.toml");
        assert!(write_starter_config(&config_path, db_path).expect("first write"));
        std::fs::write(&config_path, "[sync]\nbackground = false\n").expect("edit");
        assert!(!write_starter_config(&config_path, db_path).expect("second write"));
        let kept = std::fs::read_to_string(&config_path).expect("read");
        assert!(kept.contains("background = false"));
        let _ = std::fs::remove_dir_all(root);
    }
}
