mod daemon;
mod doctor;
mod groups;
mod messaging;
mod tasks;

use std::env;
use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use clawrelay_core::config::Paths;
use clawrelay_core::logging;

#[derive(Parser)]
#[command(
    name = "clawrelay",
    version,
    about = "Claw Relay - relays chat conversations to sandboxed agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay in the foreground (default)
    Run,
    /// Check the container runtime, settings, store and channel tokens
    Doctor,
    /// Show registrations, cursor lag and scheduled tasks
    Status,
    /// Manage group registrations
    Groups {
        #[command(subcommand)]
        command: GroupCommands,
    },
    /// Manage scheduled tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Store a message as if it arrived from a channel
    Send {
        /// Conversation id, e.g. tg:123456
        jid: String,
        /// Message text
        #[arg(required = true)]
        text: Vec<String>,
        /// Sender name shown to the agent
        #[arg(long, default_value = "Operator")]
        sender: String,
    },
    /// Show the relay log, or the latest agent run log of a group
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
        /// Keep printing new lines
        #[arg(short, long)]
        follow: bool,
        /// Show the latest container run log of this group folder instead
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupCommands {
    /// List registered groups
    List,
    /// Register a chat under an identity folder
    Register {
        /// Conversation id, e.g. tg:123456
        jid: String,
        /// Display name
        name: String,
        /// Identity folder (letters, digits, '-' and '_')
        folder: String,
        /// Trigger word; defaults to @<assistant name>
        #[arg(long)]
        trigger: Option<String>,
        /// Dispatch every message, not only triggered ones
        #[arg(long)]
        no_trigger: bool,
    },
    /// Remove a registration (the folder on disk is kept)
    Remove {
        folder: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List scheduled tasks
    List {
        /// Only tasks of this group folder
        #[arg(long)]
        group: Option<String>,
    },
    /// Pause an active task
    Pause { task_id: String },
    /// Resume a paused task
    Resume { task_id: String },
    /// Delete a task
    Cancel {
        task_id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

fn resolve_paths() -> Paths {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    Paths::resolve(&cwd)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let paths = resolve_paths();

    let command = cli.command.unwrap_or(Commands::Run);
    if !matches!(command, Commands::Run) {
        logging::init_console();
    }

    match command {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(daemon::run(paths))
        }
        Commands::Doctor => doctor::run_doctor(&paths),
        Commands::Status => daemon::status(&paths),
        Commands::Groups { command } => match command {
            GroupCommands::List => groups::list_groups(&paths),
            GroupCommands::Register {
                jid,
                name,
                folder,
                trigger,
                no_trigger,
            } => groups::register_group(
                &paths,
                groups::Registration {
                    jid,
                    name,
                    folder,
                    trigger,
                    requires_trigger: !no_trigger,
                },
            ),
            GroupCommands::Remove { folder, yes } => groups::remove_group(&paths, &folder, yes),
        },
        Commands::Tasks { command } => match command {
            TaskCommands::List { group } => tasks::list_tasks(&paths, group.as_deref()),
            TaskCommands::Pause { task_id } => tasks::pause_task(&paths, &task_id),
            TaskCommands::Resume { task_id } => tasks::resume_task(&paths, &task_id),
            TaskCommands::Cancel { task_id, yes } => tasks::cancel_task(&paths, &task_id, yes),
        },
        Commands::Send { jid, text, sender } => {
            messaging::send_message(&paths, &jid, &text.join(" "), &sender)
        }
        Commands::Logs {
            lines,
            follow,
            group,
        } => match group {
            Some(folder) => messaging::view_run_log(&paths, &folder, lines),
            None => messaging::view_logs(&paths, lines, follow),
        },
    }
}
