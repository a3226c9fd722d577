use std::process::{Command, Stdio};

use anyhow::Result;
use colored::Colorize;

use clawrelay_core::config::{get_settings, is_valid_group_folder, Paths};
use clawrelay_core::store::Store;
use clawrelay_core::types::Settings;

use crate::daemon::channel_token;

/// Run the doctor command: check prerequisites and configuration.
pub fn run_doctor(paths: &Paths) -> Result<()> {
    println!();
    println!("  {}", "Claw Relay Doctor".green().bold());
    println!("  {}", "Checking your setup...".dimmed());
    println!();

    let mut issues = 0;

    // 1. Settings
    let settings = if paths.settings_file.exists() {
        match std::fs::read_to_string(&paths.settings_file)
            .ok()
            .and_then(|raw| serde_json::from_str::<Settings>(&raw).ok())
        {
            Some(s) => {
                print_ok(&format!("Settings: {}", paths.settings_file.display()));
                s
            }
            None => {
                print_fail("Settings file is not valid JSON, defaults are in effect");
                println!("         Fix: {}", paths.settings_file.display().to_string().green());
                issues += 1;
                Settings::default()
            }
        }
    } else {
        print_warn(&format!(
            "No settings file at {}, using defaults",
            paths.settings_file.display()
        ));
        get_settings(&paths.settings_file)?
    };

    if !is_valid_group_folder(&settings.main_group_folder) {
        print_fail(&format!(
            "main_group_folder '{}' is not a valid folder name",
            settings.main_group_folder
        ));
        issues += 1;
    }

    // 2. Container runtime and image
    let runtime = settings.container.runtime.as_str();
    let runtime_ok = check_command(
        &format!("{} daemon", runtime),
        runtime,
        &["info", "--format", "{{.ServerVersion}}"],
    );
    if runtime_ok {
        let image_ok = check_command(
            &format!("Image {}", settings.container.image),
            runtime,
            &["image", "inspect", "--format", "{{.Id}}", &settings.container.image],
        );
        if !image_ok {
            println!(
                "         Build or pull it, then set {} in settings.json",
                "container.image".green()
            );
            issues += 1;
        }
    } else {
        println!("         Install Docker or Podman and make sure the daemon is running.");
        issues += 1;
    }

    // 3. Store
    if paths.store_file.exists() {
        match Store::open(&paths.store_file).and_then(|s| s.all_groups()) {
            Ok(groups) => {
                print_ok(&format!(
                    "Store: {} ({} registered group(s))",
                    paths.store_file.display(),
                    groups.len()
                ));
                if !groups.iter().any(|g| g.folder == settings.main_group_folder) {
                    print_warn(&format!(
                        "No registration uses the main folder '{}'",
                        settings.main_group_folder
                    ));
                    println!(
                        "         Register one: {}",
                        format!(
                            "clawrelay groups register <jid> Main {}",
                            settings.main_group_folder
                        )
                        .green()
                    );
                }
            }
            Err(e) => {
                print_fail(&format!("Store cannot be opened: {}", e));
                issues += 1;
            }
        }
    } else {
        print_warn("Store not created yet (created on first `clawrelay run`)");
    }

    // 4. Channels
    let telegram = channel_token(settings.telegram_token(), "TELEGRAM_BOT_TOKEN");
    let discord = channel_token(settings.discord_token(), "DISCORD_BOT_TOKEN");
    if telegram.is_some() {
        print_ok("Telegram: bot token configured");
    }
    if discord.is_some() {
        print_ok("Discord: bot token configured");
    }
    if telegram.is_none() && discord.is_none() {
        print_fail("No channel token configured");
        println!(
            "         Set {} or {} in settings.json",
            "channels.telegram.bot_token".green(),
            "channels.discord.bot_token".green()
        );
        issues += 1;
    }

    // 5. Forwarded secrets
    for name in &settings.secrets {
        if std::env::var(name).is_ok() {
            print_ok(&format!("Secret {} is set", name));
        } else {
            print_warn(&format!("Secret {} is not set in the environment", name));
        }
    }

    println!();
    if issues == 0 {
        println!("  {} {}", "All checks passed!".green().bold(), "You're good to go.".dimmed());
    } else {
        println!(
            "  {} {}",
            format!("{} issue(s) found.", issues).yellow().bold(),
            "Fix the items above and run doctor again.".dimmed()
        );
    }
    println!();

    Ok(())
}

/// Run a probe command; prints the first line of its output on success.
fn check_command(label: &str, program: &str, args: &[&str]) -> bool {
    let result = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match result {
        Ok(output) if output.status.success() => {
            let detail = String::from_utf8_lossy(&output.stdout)
                .lines()
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            if detail.is_empty() {
                print_ok(label);
            } else {
                print_ok(&format!("{} ({})", label, detail.dimmed()));
            }
            true
        }
        _ => {
            print_fail(&format!("{} not available", label));
            false
        }
    }
}

fn print_ok(msg: &str) {
    println!("  {} {}", "✓".green(), msg);
}

fn print_fail(msg: &str) {
    println!("  {} {}", "✗".red(), msg);
}

fn print_warn(msg: &str) {
    println!("  {} {}", "!".yellow(), msg);
}
