use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use clawrelay_core::channel::{pump_inbound, ChannelRegistry};
use clawrelay_core::config::{get_settings, Paths};
use clawrelay_core::logging;
use clawrelay_core::store::Store;
use clawrelay_core::types::{Settings, TaskStatus};
use clawrelay_discord::DiscordChannel;
use clawrelay_ipc::run_ipc_watcher;
use clawrelay_queue::runner::{cleanup_orphans, ensure_container_runtime};
use clawrelay_queue::{ContainerRunner, Engine, EngineConfig, GroupQueue, RouterState};
use clawrelay_scheduler::run_scheduler;
use clawrelay_telegram::TelegramChannel;

const INBOUND_BUFFER: usize = 256;

/// A token from settings, falling back to an environment variable.
pub fn channel_token(configured: Option<&str>, env_var: &str) -> Option<String> {
    configured
        .map(str::to_string)
        .or_else(|| std::env::var(env_var).ok())
        .filter(|t| !t.trim().is_empty())
}

fn build_channels(settings: &Settings) -> ChannelRegistry {
    let trigger = settings.default_trigger();
    let mut channels = ChannelRegistry::new();
    if let Some(token) = channel_token(settings.telegram_token(), "TELEGRAM_BOT_TOKEN") {
        channels.add(Arc::new(TelegramChannel::new(&token, trigger.clone())));
    }
    if let Some(token) = channel_token(settings.discord_token(), "DISCORD_BOT_TOKEN") {
        channels.add(Arc::new(DiscordChannel::new(&token, trigger)));
    }
    channels
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the relay in the foreground until Ctrl-C or SIGTERM.
pub async fn run(paths: Paths) -> Result<()> {
    paths.ensure_dirs()?;
    logging::init(&paths.log_file)?;
    let settings = get_settings(&paths.settings_file)?;
    info!(
        home = %paths.home.display(),
        assistant = %settings.assistant_name,
        "starting clawrelay"
    );

    let runtime = settings.container.runtime.clone();
    if let Err(e) = ensure_container_runtime(&runtime).await {
        error!(error = %e, "container runtime unavailable");
        eprintln!();
        eprintln!("  {}", "Container runtime not reachable.".red().bold());
        eprintln!("  Agents run inside containers; start {} and try again.", runtime.green());
        eprintln!("  Diagnose with: {}", "clawrelay doctor".green());
        eprintln!();
        return Err(e).context("container runtime is required");
    }
    if let Err(e) = cleanup_orphans(&runtime).await {
        warn!(error = %e, "could not list orphaned containers");
    }

    let store = Store::open(&paths.store_file).context("failed to open message store")?;
    let state = RouterState::load(store.clone()).context("failed to load router state")?;
    for group in state.groups() {
        paths.ensure_group_dirs(&group.folder)?;
    }
    paths.ensure_group_dirs(&settings.main_group_folder)?;

    let channels = build_channels(&settings);
    if channels.is_empty() {
        warn!("no channel tokens configured, only `clawrelay send` input will be processed");
    }
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
    let pump = tokio::spawn(pump_inbound(store.clone(), inbound_rx));
    channels
        .connect_all(inbound_tx.clone())
        .await
        .context("failed to connect channels")?;

    let project_root = std::env::current_dir().context("failed to read working directory")?;
    let runner = ContainerRunner::new(
        paths.clone(),
        settings.container.clone(),
        settings.main_group_folder.clone(),
        project_root,
        settings.secrets.clone(),
    );
    let engine = Engine::new(
        state,
        GroupQueue::new(settings.container.max_concurrent),
        Arc::new(runner),
        channels.clone(),
        EngineConfig::from_settings(&settings),
        paths.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ipc = tokio::spawn(run_ipc_watcher(
        engine.clone(),
        Duration::from_millis(settings.ipc_poll_interval_ms),
        shutdown_rx.clone(),
    ));
    let scheduler = tokio::spawn(run_scheduler(
        engine.clone(),
        Duration::from_millis(settings.scheduler_poll_interval_ms),
        shutdown_rx.clone(),
    ));
    match engine.recover_pending() {
        Ok(0) => {}
        Ok(n) => info!(groups = n, "recovered groups with unprocessed messages"),
        Err(e) => error!(error = %e, "recovery scan failed"),
    }
    let loop_engine = engine.clone();
    let message_loop = tokio::spawn(async move { loop_engine.run_loop(shutdown_rx).await });

    info!(channels = ?channels.names(), groups = engine.state().groups().len(), "clawrelay running");
    wait_for_signal().await;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    for handle in [message_loop, ipc, scheduler] {
        if let Err(e) = handle.await {
            warn!(error = %e, "background loop ended abnormally");
        }
    }
    engine
        .queue()
        .shutdown(Duration::from_millis(settings.shutdown_grace_ms))
        .await;
    channels.disconnect_all().await;
    drop(inbound_tx);
    if tokio::time::timeout(Duration::from_secs(2), pump).await.is_err() {
        warn!("inbound writer did not drain in time");
    }
    info!("clawrelay stopped");
    Ok(())
}

/// Print registrations with their cursor lag, plus scheduled tasks.
pub fn status(paths: &Paths) -> Result<()> {
    let settings = get_settings(&paths.settings_file)?;

    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_blue());
    println!("  {}", "Claw Relay Status".green().bold());
    println!("{}", "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━".bright_blue());
    println!();
    println!("  Home:      {}", paths.home.display().to_string().bright_white());
    println!("  Assistant: {}", settings.default_trigger().bright_white());

    let mut channels = Vec::new();
    if channel_token(settings.telegram_token(), "TELEGRAM_BOT_TOKEN").is_some() {
        channels.push("Telegram");
    }
    if channel_token(settings.discord_token(), "DISCORD_BOT_TOKEN").is_some() {
        channels.push("Discord");
    }
    if channels.is_empty() {
        println!("  Channels:  {}", "none".yellow());
    } else {
        println!("  Channels:  {}", channels.join(", ").bright_white());
    }

    if !paths.store_file.exists() {
        println!();
        println!("  {}", "No store yet. Start the relay with `clawrelay run`.".yellow());
        println!();
        return Ok(());
    }
    let store = Store::open(&paths.store_file)?;
    let state = RouterState::load(store.clone())?;

    let groups = state.groups();
    println!("  Groups:    {}", groups.len().to_string().bright_white());
    for group in &groups {
        let cursor = state.agent_cursor(&group.folder);
        let pending = store.messages_since(&group.jid, cursor, i64::MAX)?.len();
        let lag = if pending == 0 {
            "up to date".green()
        } else {
            format!("{} pending", pending).yellow()
        };
        let main = if group.folder == settings.main_group_folder {
            " (main)".green().to_string()
        } else {
            String::new()
        };
        println!(
            "             {}{} {} {}",
            group.folder.bright_white(),
            main,
            group.jid.dimmed(),
            lag
        );
    }

    let tasks = store.all_tasks()?;
    let active = tasks.iter().filter(|t| t.status == TaskStatus::Active).count();
    println!(
        "  Tasks:     {} active, {} total",
        active.to_string().bright_white(),
        tasks.len()
    );
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Active) {
        println!(
            "             {} {} next {}",
            task.id.bright_white(),
            task.group_folder.dimmed(),
            task.next_run.as_deref().unwrap_or("-").dimmed()
        );
    }
    println!();
    Ok(())
}
