use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use colored::Colorize;
use rand::Rng;

use clawrelay_core::config::{is_valid_group_folder, Paths};
use clawrelay_core::logging::read_tail;
use clawrelay_core::store::Store;
use clawrelay_core::types::{now_iso, NewMessage};

/// Store a message as if it arrived from a channel. The running relay picks
/// it up on its next poll.
pub fn send_message(paths: &Paths, jid: &str, text: &str, sender: &str) -> Result<()> {
    if text.trim().is_empty() {
        println!("{}", "Message cannot be empty.".yellow());
        return Ok(());
    }
    if !jid.contains(':') {
        bail!("'{}' is not a conversation id (expected e.g. tg:123456)", jid);
    }

    paths.ensure_dirs()?;
    let store = Store::open(&paths.store_file).context("failed to open store")?;
    let timestamp = now_iso();
    let message = NewMessage {
        id: format!("cli-{}", random_suffix()),
        chat_jid: jid.to_string(),
        sender: "cli".to_string(),
        sender_name: sender.to_string(),
        content: text.to_string(),
        timestamp: timestamp.clone(),
        is_from_me: false,
        is_bot_message: false,
        seq: 0,
    };
    store.store_chat_metadata(jid, &timestamp, None, None)?;
    store.store_message(&message)?;

    let registered = store.all_groups()?.iter().any(|g| g.jid == jid);
    println!("{} Message stored for {}", "✓".green(), jid.bright_white());
    if !registered {
        println!(
            "  {} no group is registered for {}; it will not be dispatched",
            "!".yellow(),
            jid
        );
    }
    Ok(())
}

/// Print the tail of the relay log, optionally following it.
pub fn view_logs(paths: &Paths, lines: usize, follow: bool) -> Result<()> {
    if !paths.log_file.exists() {
        println!("{} Log file not found: {}", "Warning:".yellow(), paths.log_file.display());
        if !follow {
            return Ok(());
        }
        println!("Waiting for log output...");
    }

    if follow {
        println!("Tailing {}", paths.log_file.display().to_string().dimmed());
        println!("{}", "(Ctrl+C to stop)".dimmed());
        println!();
        Command::new("tail")
            .args([
                "-n",
                &lines.to_string(),
                "-F",
                &paths.log_file.to_string_lossy(),
            ])
            .status()
            .context("failed to run tail")?;
        return Ok(());
    }

    for line in read_tail(&paths.log_file, lines) {
        println!("{}", line);
    }
    Ok(())
}

/// Newest `container-*.log` in a group's logs directory.
pub fn latest_run_log(paths: &Paths, folder: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(paths.group_logs_dir(folder)).ok()?;
    entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .map(|n| {
                    let n = n.to_string_lossy();
                    n.starts_with("container-") && n.ends_with(".log")
                })
                .unwrap_or(false)
        })
        .max()
}

/// Print the latest agent run log of a group.
pub fn view_run_log(paths: &Paths, folder: &str, lines: usize) -> Result<()> {
    if !is_valid_group_folder(folder) {
        bail!("invalid folder name '{}'", folder);
    }
    let Some(log) = latest_run_log(paths, folder) else {
        println!("{} No agent runs logged for '{}'.", "Warning:".yellow(), folder);
        return Ok(());
    };
    println!("{}", log.display().to_string().dimmed());
    println!();
    for line in read_tail(&log, lines) {
        println!("{}", line);
    }
    Ok(())
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    let millis = chrono::Utc::now().timestamp_millis();
    let suffix: String = (0..6)
        .map(|_| {
            let idx = rng.gen_range(0..36u8);
            if idx < 10 {
                (b'0' + idx) as char
            } else {
                (b'a' + idx - 10) as char
            }
        })
        .collect();
    format!("{}-{}", millis, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_send_stores_user_message() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());

        send_message(&paths, "tg:42", "@Andy hello there", "Operator").unwrap();

        let store = Store::open(&paths.store_file).unwrap();
        let stored = store
            .new_messages(&["tg:42".to_string()], 0)
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "@Andy hello there");
        assert_eq!(stored[0].sender_name, "Operator");
        assert!(!stored[0].is_bot_message);
        assert!(stored[0].id.starts_with("cli-"));
    }

    #[test]
    fn test_send_rejects_bare_id() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());
        assert!(send_message(&paths, "42", "hi", "Operator").is_err());
        send_message(&paths, "tg:42", "   ", "Operator").unwrap();
        assert!(!paths.store_file.exists());
    }

    #[test]
    fn test_latest_run_log() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());
        assert!(latest_run_log(&paths, "family").is_none());

        let dir = paths.group_logs_dir("family");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("container-2024-01-01T00-00-00.log"), "old").unwrap();
        std::fs::write(dir.join("container-2024-06-01T00-00-00.log"), "new").unwrap();
        std::fs::write(dir.join("notes.txt"), "x").unwrap();

        let latest = latest_run_log(&paths, "family").unwrap();
        assert!(latest.ends_with("container-2024-06-01T00-00-00.log"));
        view_run_log(&paths, "family", 10).unwrap();
    }
}
