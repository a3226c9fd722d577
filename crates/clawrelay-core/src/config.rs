use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::types::Settings;

static FOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("valid folder regex"));

/// Folder names that collide with host-side directories.
const RESERVED_FOLDERS: &[&str] = &["errors", "global"];

/// All resolved paths for Claw Relay directories
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.clawrelay or local .clawrelay/)
    pub home: PathBuf,
    pub settings_file: PathBuf,
    pub store_file: PathBuf,
    pub log_file: PathBuf,
    /// One working directory per identity folder, mounted into its agent.
    pub groups_dir: PathBuf,
    pub data_dir: PathBuf,
    /// Command-channel mailboxes, one per identity folder.
    pub ipc_dir: PathBuf,
    /// Agent session state, one per identity folder.
    pub sessions_dir: PathBuf,
}

impl Paths {
    /// Resolve the home directory:
    /// 1. CLAWRELAY_HOME env var
    /// 2. local .clawrelay/ if it has settings.json
    /// 3. ~/.clawrelay/
    pub fn resolve(cwd: &Path) -> Self {
        let home = if let Ok(env_home) = std::env::var("CLAWRELAY_HOME") {
            PathBuf::from(env_home)
        } else {
            let local = cwd.join(".clawrelay");
            if local.join("settings.json").exists() {
                local
            } else {
                dirs_home().join(".clawrelay")
            }
        };
        Self::from_home(home)
    }

    pub fn from_home(home: PathBuf) -> Self {
        let data_dir = home.join("data");
        Self {
            settings_file: home.join("settings.json"),
            store_file: home.join("store.db"),
            log_file: home.join("logs/clawrelay.log"),
            groups_dir: home.join("groups"),
            ipc_dir: data_dir.join("ipc"),
            sessions_dir: data_dir.join("sessions"),
            data_dir,
            home,
        }
    }

    /// Ensure the top-level data directories exist
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.groups_dir, &self.ipc_dir, &self.sessions_dir] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        if let Some(dir) = self.log_file.parent() {
            std::fs::create_dir_all(dir).context("Failed to create log dir")?;
        }
        Ok(())
    }

    pub fn group_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir.join(folder)
    }

    pub fn group_logs_dir(&self, folder: &str) -> PathBuf {
        self.groups_dir.join(folder).join("logs")
    }

    pub fn group_ipc_dir(&self, folder: &str) -> PathBuf {
        self.ipc_dir.join(folder)
    }

    pub fn group_session_dir(&self, folder: &str) -> PathBuf {
        self.sessions_dir.join(folder)
    }

    /// Quarantine for rejected command files.
    pub fn ipc_errors_dir(&self) -> PathBuf {
        self.ipc_dir.join("errors")
    }

    /// Create the per-identity directories an agent run needs.
    pub fn ensure_group_dirs(&self, folder: &str) -> Result<()> {
        let ipc = self.group_ipc_dir(folder);
        for dir in [
            self.group_logs_dir(folder),
            ipc.join("messages"),
            ipc.join("tasks"),
            self.group_session_dir(folder),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

/// Get user home directory
fn dirs_home() -> PathBuf {
    directories::BaseDirs::new()
        .map(|d| d.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

/// Whether `name` is acceptable as an identity folder.
pub fn is_valid_group_folder(name: &str) -> bool {
    FOLDER_RE.is_match(name) && !RESERVED_FOLDERS.contains(&name.to_ascii_lowercase().as_str())
}

/// Load and parse settings.json
pub fn get_settings(settings_file: &Path) -> Result<Settings> {
    if !settings_file.exists() {
        return Ok(Settings::default());
    }

    let data =
        std::fs::read_to_string(settings_file).context("Failed to read settings.json")?;

    match serde_json::from_str(&data) {
        Ok(s) => Ok(s),
        Err(e) => {
            warn!(error = %e, "settings.json contains invalid JSON, using defaults");
            Ok(Settings::default())
        }
    }
}

/// Write settings.json, creating the home directory if needed.
pub fn save_settings(settings_file: &Path, settings: &Settings) -> Result<()> {
    if let Some(dir) = settings_file.parent() {
        std::fs::create_dir_all(dir).context("Failed to create settings dir")?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(settings_file, json + "\n").context("Failed to write settings.json")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_settings(dir: &Path, content: &str) -> PathBuf {
        let file = dir.join("settings.json");
        let mut f = std::fs::File::create(&file).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_get_settings_missing_file() {
        let settings = get_settings(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.assistant_name, "Andy");
        assert_eq!(settings.main_group_folder, "main");
    }

    #[test]
    fn test_get_settings_invalid_json_falls_back() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(tmp.path(), "{ not json");
        let settings = get_settings(&file).unwrap();
        assert_eq!(settings.container.max_concurrent, 5);
    }

    #[test]
    fn test_get_settings_with_channels() {
        let tmp = TempDir::new().unwrap();
        let file = write_settings(
            tmp.path(),
            r#"{
                "assistant_name": "Claw",
                "channels": {
                    "telegram": { "bot_token": "123:abc" },
                    "discord": { "bot_token": "" }
                }
            }"#,
        );
        let settings = get_settings(&file).unwrap();
        assert_eq!(settings.telegram_token(), Some("123:abc"));
        assert_eq!(settings.discord_token(), None);
    }

    #[test]
    fn test_save_then_load_settings() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("nested/settings.json");
        let mut settings = Settings::default();
        settings.idle_timeout_ms = 5_000;
        save_settings(&file, &settings).unwrap();
        assert_eq!(get_settings(&file).unwrap().idle_timeout_ms, 5_000);
    }

    #[test]
    fn test_paths_layout() {
        let paths = Paths::from_home(PathBuf::from("/srv/claw"));
        assert_eq!(paths.store_file, PathBuf::from("/srv/claw/store.db"));
        assert_eq!(paths.group_ipc_dir("main"), PathBuf::from("/srv/claw/data/ipc/main"));
        assert_eq!(paths.ipc_errors_dir(), PathBuf::from("/srv/claw/data/ipc/errors"));
    }

    #[test]
    fn test_ensure_group_dirs() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());
        paths.ensure_group_dirs("family").unwrap();
        assert!(paths.group_ipc_dir("family").join("tasks").is_dir());
        assert!(paths.group_logs_dir("family").is_dir());
    }

    #[test]
    fn test_group_folder_validation() {
        assert!(is_valid_group_folder("main"));
        assert!(is_valid_group_folder("family-chat_2"));
        assert!(!is_valid_group_folder("../etc"));
        assert!(!is_valid_group_folder("-dash"));
        assert!(!is_valid_group_folder(""));
        assert!(!is_valid_group_folder("errors"));
        assert!(!is_valid_group_folder(&"a".repeat(65)));
    }
}
