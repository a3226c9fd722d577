use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::Confirm;

use clawrelay_core::config::Paths;
use clawrelay_core::logging::preview;
use clawrelay_core::store::Store;
use clawrelay_core::types::{RunStatus, ScheduledTask, TaskStatus};

fn open_store(paths: &Paths) -> Result<Option<Store>> {
    if !paths.store_file.exists() {
        return Ok(None);
    }
    Store::open(&paths.store_file)
        .context("failed to open store")
        .map(Some)
}

fn status_label(status: TaskStatus) -> String {
    match status {
        TaskStatus::Active => "active".green().to_string(),
        TaskStatus::Paused => "paused".yellow().to_string(),
        TaskStatus::Completed => "completed".dimmed().to_string(),
    }
}

fn print_task(store: &Store, task: &ScheduledTask) -> Result<()> {
    println!(
        "  {} {} {}",
        task.id.bright_white().bold(),
        format!("[{}]", task.group_folder).dimmed(),
        status_label(task.status)
    );
    println!(
        "    Schedule: {} {}",
        task.schedule_type.as_str().bright_white(),
        task.schedule_value.bright_white()
    );
    println!("    Prompt:   {}", preview(&task.prompt, 70));
    if let Some(next) = &task.next_run {
        println!("    Next run: {}", next.dimmed());
    }
    if let Some(last) = store.task_run_logs(&task.id, 1)?.first() {
        let outcome = match last.status {
            RunStatus::Success => "ok".green(),
            RunStatus::Error => "error".red(),
        };
        println!(
            "    Last run: {} {} ({} ms)",
            last.run_at.dimmed(),
            outcome,
            last.duration_ms
        );
    }
    println!();
    Ok(())
}

/// List scheduled tasks, optionally for one group folder.
pub fn list_tasks(paths: &Paths, group: Option<&str>) -> Result<()> {
    let Some(store) = open_store(paths)? else {
        println!("{}", "No scheduled tasks.".yellow());
        return Ok(());
    };
    let tasks = match group {
        Some(folder) => store.tasks_for_group(folder)?,
        None => store.all_tasks()?,
    };
    if tasks.is_empty() {
        println!("{}", "No scheduled tasks.".yellow());
        return Ok(());
    }

    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_blue());
    println!("  {}", "Scheduled Tasks".green().bold());
    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_blue());
    println!();
    for task in &tasks {
        print_task(&store, task)?;
    }
    Ok(())
}

fn set_status(paths: &Paths, task_id: &str, status: TaskStatus) -> Result<bool> {
    let Some(store) = open_store(paths)? else {
        println!("{} Task '{}' not found.", "Error:".red(), task_id);
        return Ok(false);
    };
    if !store.update_task_status(task_id, status)? {
        println!("{} Task '{}' not found.", "Error:".red(), task_id);
        return Ok(false);
    }
    println!("{} Task {} is now {}", "✓".green(), task_id.bright_white(), status_label(status));
    Ok(true)
}

pub fn pause_task(paths: &Paths, task_id: &str) -> Result<()> {
    set_status(paths, task_id, TaskStatus::Paused).map(|_| ())
}

pub fn resume_task(paths: &Paths, task_id: &str) -> Result<()> {
    set_status(paths, task_id, TaskStatus::Active).map(|_| ())
}

/// Delete a task and its run history.
pub fn cancel_task(paths: &Paths, task_id: &str, yes: bool) -> Result<()> {
    let Some(store) = open_store(paths)? else {
        println!("{} Task '{}' not found.", "Error:".red(), task_id);
        return Ok(());
    };
    let Some(task) = store.get_task(task_id)? else {
        println!("{} Task '{}' not found.", "Error:".red(), task_id);
        return Ok(());
    };

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!(
                "Cancel task {} ({})?",
                task.id,
                preview(&task.prompt, 40)
            ))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Cancelled.");
            return Ok(());
        }
    }

    store.delete_task(task_id)?;
    println!("{} Task {} cancelled", "✓".green(), task_id.bright_white());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clawrelay_core::types::{now_iso, ContextMode, ScheduleType};
    use tempfile::TempDir;

    fn seed(paths: &Paths) -> Store {
        paths.ensure_dirs().unwrap();
        let store = Store::open(&paths.store_file).unwrap();
        store
            .create_task(&ScheduledTask {
                id: "task-1".to_string(),
                group_folder: "family".to_string(),
                chat_jid: "tg:42".to_string(),
                prompt: "water the plants".to_string(),
                schedule_type: ScheduleType::Interval,
                schedule_value: "3600000".to_string(),
                context_mode: ContextMode::Isolated,
                next_run: Some(now_iso()),
                last_run: None,
                last_result: None,
                status: TaskStatus::Active,
                created_at: now_iso(),
            })
            .unwrap();
        store
    }

    #[test]
    fn test_pause_resume_cancel() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());
        let store = seed(&paths);

        pause_task(&paths, "task-1").unwrap();
        assert_eq!(store.get_task("task-1").unwrap().unwrap().status, TaskStatus::Paused);
        resume_task(&paths, "task-1").unwrap();
        assert_eq!(store.get_task("task-1").unwrap().unwrap().status, TaskStatus::Active);

        list_tasks(&paths, Some("family")).unwrap();
        cancel_task(&paths, "task-1", true).unwrap();
        assert!(store.get_task("task-1").unwrap().is_none());
    }

    #[test]
    fn test_unknown_task_is_reported_not_failed() {
        let tmp = TempDir::new().unwrap();
        let paths = Paths::from_home(tmp.path().to_path_buf());
        seed(&paths);
        assert!(!set_status(&paths, "missing", TaskStatus::Paused).unwrap());
        cancel_task(&paths, "missing", true).unwrap();
    }
}
