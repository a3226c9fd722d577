use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use clawrelay_core::config::is_valid_group_folder;
use clawrelay_core::router::format_outbound;
use clawrelay_core::schedule::initial_next_run;
use clawrelay_core::types::{now_iso, RegisteredGroup, ScheduledTask, TaskStatus};
use clawrelay_queue::Engine;

use crate::commands::{authorize, task_target, IpcError, IpcRequest, Requester};

const MAILBOXES: &[&str] = &["messages", "tasks"];
const ERRORS_DIR: &str = "errors";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IpcStats {
    pub processed: usize,
    pub rejected: usize,
}

pub fn new_task_id() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("task-{}-{}", Utc::now().timestamp_millis(), suffix.to_lowercase())
}

/// Pending request files in one mailbox, oldest name first.
fn list_requests(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

/// Move a rejected request to `errors/<folder>-<file>`.
fn quarantine(ipc_dir: &Path, folder: &str, file: &Path) {
    let errors = ipc_dir.join(ERRORS_DIR);
    let name = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "request.json".to_string());
    let dest = errors.join(format!("{}-{}", folder, name));
    let moved = std::fs::create_dir_all(&errors).and_then(|_| std::fs::rename(file, &dest));
    if let Err(e) = moved {
        error!(file = %file.display(), error = %e, "failed to quarantine request, deleting");
        let _ = std::fs::remove_file(file);
    }
}

/// Drain every mailbox once.
pub async fn process_once(engine: &Engine) -> IpcStats {
    let ipc_dir = engine.paths().ipc_dir.clone();
    let mut stats = IpcStats::default();
    let Ok(entries) = std::fs::read_dir(&ipc_dir) else {
        return stats;
    };
    let mut folders: Vec<String> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|name| name != ERRORS_DIR)
        .collect();
    folders.sort();

    for folder in folders {
        if !is_valid_group_folder(&folder) {
            warn!(folder = %folder, "ignoring mailbox with invalid folder name");
            continue;
        }
        let requester = Requester::new(&folder, &engine.config().main_folder);
        for mailbox in MAILBOXES {
            for file in list_requests(&ipc_dir.join(&folder).join(mailbox)) {
                match handle_file(engine, &requester, &file).await {
                    Ok(kind) => {
                        debug!(folder = %folder, kind, "request processed");
                        if let Err(e) = std::fs::remove_file(&file) {
                            warn!(file = %file.display(), error = %e, "failed to remove processed request");
                        }
                        stats.processed += 1;
                    }
                    Err(e) => {
                        warn!(folder = %folder, file = %file.display(), error = %e, "request rejected");
                        quarantine(&ipc_dir, &folder, &file);
                        stats.rejected += 1;
                    }
                }
            }
        }
    }
    stats
}

async fn handle_file(
    engine: &Engine,
    requester: &Requester,
    file: &Path,
) -> Result<&'static str, IpcError> {
    let raw = std::fs::read_to_string(file)?;
    let request = IpcRequest::parse(&raw)?;
    authorize(engine, requester, &request)?;
    let kind = request.kind();
    execute(engine, requester, request).await?;
    Ok(kind)
}

/// Carry out an authorized request.
pub async fn execute(
    engine: &Engine,
    requester: &Requester,
    request: IpcRequest,
) -> Result<(), IpcError> {
    match request {
        IpcRequest::Message { chat_jid, text } => {
            let Some(text) = format_outbound(&text) else {
                return Ok(());
            };
            engine
                .channels()
                .send_message(&chat_jid, &text)
                .await
                .map_err(|e| IpcError::Delivery(e.to_string()))?;
            info!(folder = %requester.folder, jid = %chat_jid, "agent message sent");
        }
        IpcRequest::Reaction {
            chat_jid,
            message_id,
            emoji,
        } => {
            engine
                .channels()
                .send_reaction(&chat_jid, &message_id, &emoji)
                .await
                .map_err(|e| IpcError::Delivery(e.to_string()))?;
        }
        IpcRequest::ScheduleTask {
            prompt,
            schedule_type,
            schedule_value,
            context_mode,
            target_jid,
        } => {
            let target = task_target(engine, requester, target_jid.as_deref())?;
            let next_run = initial_next_run(schedule_type, &schedule_value, Utc::now())?;
            let task = ScheduledTask {
                id: new_task_id(),
                group_folder: target.folder.clone(),
                chat_jid: target.jid.clone(),
                prompt,
                schedule_type,
                schedule_value,
                context_mode,
                next_run,
                last_run: None,
                last_result: None,
                status: TaskStatus::Active,
                created_at: now_iso(),
            };
            engine.store().create_task(&task)?;
            info!(
                task_id = %task.id,
                group = %task.group_folder,
                schedule_type = %task.schedule_type,
                schedule_value = %task.schedule_value,
                "task scheduled"
            );
            refresh_snapshots(engine, &requester.folder);
        }
        IpcRequest::PauseTask { task_id } => {
            set_status(engine, &task_id, TaskStatus::Paused)?;
            refresh_snapshots(engine, &requester.folder);
        }
        IpcRequest::ResumeTask { task_id } => {
            set_status(engine, &task_id, TaskStatus::Active)?;
            refresh_snapshots(engine, &requester.folder);
        }
        IpcRequest::CancelTask { task_id } => {
            if !engine.store().delete_task(&task_id)? {
                return Err(IpcError::NotFound(format!("task {}", task_id)));
            }
            info!(task_id = %task_id, "task cancelled");
            refresh_snapshots(engine, &requester.folder);
        }
        IpcRequest::RegisterGroup {
            jid,
            name,
            folder,
            trigger,
            requires_trigger,
        } => {
            if !is_valid_group_folder(&folder) {
                return Err(IpcError::Invalid(format!("folder name '{}'", folder)));
            }
            let group = RegisteredGroup {
                jid,
                name,
                trigger: trigger
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| format!("@{}", engine.config().assistant_name)),
                requires_trigger: requires_trigger.unwrap_or(true),
                added_at: now_iso(),
                container_config: None,
                folder,
            };
            engine
                .paths()
                .ensure_group_dirs(&group.folder)
                .map_err(|e| IpcError::Invalid(e.to_string()))?;
            engine.state().register_group(group)?;
            refresh_snapshots(engine, &requester.folder);
        }
        IpcRequest::RefreshGroups => {
            let count = engine.state().reload_groups()?;
            info!(groups = count, "registrations reloaded");
            refresh_snapshots(engine, &requester.folder);
        }
    }
    Ok(())
}

fn set_status(engine: &Engine, task_id: &str, status: TaskStatus) -> Result<(), IpcError> {
    if !engine.store().update_task_status(task_id, status)? {
        return Err(IpcError::NotFound(format!("task {}", task_id)));
    }
    info!(task_id, status = %status, "task status changed");
    Ok(())
}

fn refresh_snapshots(engine: &Engine, folder: &str) {
    if let Err(e) = engine.write_snapshots(folder) {
        warn!(folder, error = %e, "failed to refresh snapshots");
    }
}

/// Watch the mailbox root so new requests are picked up before the next tick.
fn start_watcher(ipc_dir: &Path, wake: mpsc::Sender<()>) -> Result<notify::RecommendedWatcher> {
    std::fs::create_dir_all(ipc_dir)?;
    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<Event, notify::Error>| {
            if let Ok(event) = res {
                if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    // A full channel already holds a pending wakeup.
                    let _ = wake.try_send(());
                }
            }
        },
    )?;
    watcher.watch(ipc_dir, RecursiveMode::Recursive)?;
    Ok(watcher)
}

/// Process mailboxes every `interval`, and early whenever a file appears.
pub async fn run_ipc_watcher(engine: Engine, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let ipc_dir = engine.paths().ipc_dir.clone();
    let (wake_tx, mut wake_rx) = mpsc::channel(1);
    let _watcher = match start_watcher(&ipc_dir, wake_tx) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "file watcher unavailable, polling only");
            None
        }
    };
    info!(dir = %ipc_dir.display(), interval_ms = interval.as_millis() as u64, "ipc watcher started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            Some(()) = wake_rx.recv() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }
        let stats = process_once(&engine).await;
        if stats.processed + stats.rejected > 0 {
            debug!(processed = stats.processed, rejected = stats.rejected, "ipc pass");
        }
    }
    info!("ipc watcher stopped");
}
