use anyhow::{bail, Context, Result};
use colored::Colorize;
use dialoguer::Confirm;

use clawrelay_core::config::{get_settings, is_valid_group_folder, Paths};
use clawrelay_core::store::Store;
use clawrelay_core::types::{now_iso, RegisteredGroup};

pub struct Registration {
    pub jid: String,
    pub name: String,
    pub folder: String,
    pub trigger: Option<String>,
    pub requires_trigger: bool,
}

fn open_store(paths: &Paths) -> Result<Store> {
    paths.ensure_dirs()?;
    Store::open(&paths.store_file).context("failed to open store")
}

/// Ask a running relay to re-read registrations through the main mailbox.
pub fn request_refresh(paths: &Paths, main_folder: &str) -> Result<()> {
    let dir = paths.group_ipc_dir(main_folder).join("tasks");
    std::fs::create_dir_all(&dir)?;
    let millis = chrono::Utc::now().timestamp_millis();
    let tmp = dir.join(format!(".cli-refresh-{}.json.tmp", millis));
    std::fs::write(
        &tmp,
        serde_json::json!({ "type": "refresh_groups", "timestamp": now_iso() }).to_string(),
    )?;
    std::fs::rename(&tmp, dir.join(format!("cli-refresh-{}.json", millis)))?;
    Ok(())
}

/// List registered groups
pub fn list_groups(paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let groups = open_store(paths)?.all_groups()?;

    if groups.is_empty() {
        println!("{}", "No groups registered.".yellow());
        println!(
            "Register one with: {}",
            "clawrelay groups register <jid> <name> <folder>".green()
        );
        return Ok(());
    }

    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_blue());
    println!("  {}", "Registered Groups".green().bold());
    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_blue());
    println!();

    for group in &groups {
        let role = if group.folder == settings.main_group_folder {
            " main".green().to_string()
        } else {
            String::new()
        };
        println!(
            "  {} {}{}",
            group.folder.bright_white().bold(),
            format!("({})", group.name).dimmed(),
            role
        );
        println!("    Chat:    {}", group.jid.bright_white());
        let trigger = if group.requires_trigger {
            group.trigger.clone()
        } else {
            format!("{} (not required)", group.trigger)
        };
        println!("    Trigger: {}", trigger.bright_white());
        println!("    Added:   {}", group.added_at.dimmed());
        println!();
    }
    Ok(())
}

/// Register a chat under an identity folder
pub fn register_group(paths: &Paths, registration: Registration) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let Registration {
        jid,
        name,
        folder,
        trigger,
        requires_trigger,
    } = registration;

    if !is_valid_group_folder(&folder) {
        bail!(
            "invalid folder name '{}': use letters, digits, '-' and '_' (max 64)",
            folder
        );
    }
    if jid.trim().is_empty() {
        bail!("chat id must not be empty");
    }

    let store = open_store(paths)?;
    if let Some(existing) = store.get_group(&folder)? {
        bail!(
            "folder '{}' is already registered to {}",
            folder,
            existing.jid
        );
    }

    let group = RegisteredGroup {
        jid,
        name,
        folder,
        trigger: trigger
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| settings.default_trigger()),
        requires_trigger,
        added_at: now_iso(),
        container_config: None,
    };
    store.register_group(&group)?;
    paths.ensure_group_dirs(&group.folder)?;
    request_refresh(paths, &settings.main_group_folder)?;

    println!(
        "{} Registered {} as {}",
        "✓".green(),
        group.jid.bright_white(),
        group.folder.bright_white().bold()
    );
    Ok(())
}

/// Remove a registration. The group's folder is left on disk.
pub fn remove_group(paths: &Paths, folder: &str, yes: bool) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;
    let store = open_store(paths)?;
    let Some(group) = store.get_group(folder)? else {
        println!("{} Group '{}' not found.", "Error:".red(), folder);
        return Ok(());
    };

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Remove registration '{}' ({})?", group.folder, group.jid))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store.remove_group(folder)?;
    request_refresh(paths, &settings.main_group_folder)?;
    println!("{} Removed {}", "✓".green(), folder.bright_white());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registration(folder: &str) -> Registration {
        Registration {
            jid: "tg:42".to_string(),
            name: "Family".to_string(),
            folder: folder.to_string(),
            trigger: None,
            requires_trigger: true,
        }
    }

    #[test]
    fn test_register_and_remove() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());

        register_group(&paths, registration("family")).unwrap();
        let store = Store::open(&paths.store_file).unwrap();
        let group = store.get_group("family").unwrap().unwrap();
        assert_eq!(group.trigger, "@Andy");
        assert!(paths.group_ipc_dir("family").join("messages").is_dir());

        // Running relays are told to reload.
        let requests: Vec<_> = std::fs::read_dir(paths.group_ipc_dir("main").join("tasks"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .collect();
        assert!(requests.iter().any(|n| n.starts_with("cli-refresh-") && n.ends_with(".json")));

        remove_group(&paths, "family", true).unwrap();
        assert!(store.get_group("family").unwrap().is_none());
    }

    #[test]
    fn test_register_rejects_bad_or_duplicate_folder() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());

        assert!(register_group(&paths, registration("../escape")).is_err());
        assert!(register_group(&paths, registration("errors")).is_err());
        register_group(&paths, registration("family")).unwrap();
        assert!(register_group(&paths, registration("family")).is_err());
    }
}
