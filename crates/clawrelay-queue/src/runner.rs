use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use clawrelay_core::config::Paths;
use clawrelay_core::types::{AdditionalMount, ContainerSettings, RegisteredGroup};

use crate::group_queue::{ProcessControl, ProcessEndpoint, ProcessHandle, StdinCommand};

pub const CONTAINER_PREFIX: &str = "clawrelay-";
/// Slack added on top of the idle timeout so the idle close fires first.
const HARD_TIMEOUT_SLACK: Duration = Duration::from_secs(30);
const STOP_GRACE_SECS: u32 = 10;
/// Paths never mounted into an agent, even when under an allowed root.
const BLOCKED_MOUNT_COMPONENTS: &[&str] = &[".ssh", ".gnupg", ".aws", ".kube", ".docker"];

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("container runtime '{runtime}' is not available: {reason}")]
    RuntimeUnavailable { runtime: String, reason: String },
    #[error("failed to spawn agent container: {0}")]
    Spawn(std::io::Error),
    #[error("failed to prepare agent run: {0}")]
    Prepare(#[from] anyhow::Error),
    #[error("failed to encode agent input: {0}")]
    Encode(#[from] serde_json::Error),
}

/// First stdin line of every run. Never carries secrets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    pub is_scheduled_task: bool,
    pub assistant_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    #[serde(alias = "success")]
    Ok,
    Error,
}

/// One NDJSON line from the agent's stdout.
/// `result: None` marks the end of a unit of work (liveness, not output).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub status: EventStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub new_session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl AgentEvent {
    pub fn is_error(&self) -> bool {
        self.status == EventStatus::Error
    }
}

/// Parse a stdout line. Anything that isn't an event is agent chatter.
pub fn parse_event_line(line: &str) -> Option<AgentEvent> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed(String),
    TimedOut,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success)
    }
}

pub struct RunRequest {
    pub group: RegisteredGroup,
    pub input: AgentInput,
    pub idle_timeout: Duration,
}

/// A started agent run: a handle for stdin/control, the event stream, and
/// the final outcome once the process has exited.
pub struct AgentRun {
    pub handle: ProcessHandle,
    pub events: mpsc::Receiver<AgentEvent>,
    pub outcome: oneshot::Receiver<RunOutcome>,
}

pub trait AgentRunner: Send + Sync {
    fn start(&self, request: RunRequest) -> Result<AgentRun, RunnerError>;
}

/// Run a command and capture stdout. Returns an error if the process exits non-zero.
pub async fn run_command(command: &str, args: &[&str]) -> anyhow::Result<String> {
    let output = Command::new(command)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to spawn command {}: {}", command, e))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let msg = if stderr.is_empty() {
            format!("Command exited with code {:?}", output.status.code())
        } else {
            stderr
        };
        Err(anyhow::anyhow!(msg))
    }
}

/// Fail fast when the container runtime cannot be reached.
pub async fn ensure_container_runtime(runtime: &str) -> Result<(), RunnerError> {
    run_command(runtime, &["info", "--format", "{{.ServerVersion}}"])
        .await
        .map(|version| info!(runtime, version = version.trim(), "container runtime available"))
        .map_err(|e| RunnerError::RuntimeUnavailable {
            runtime: runtime.to_string(),
            reason: e.to_string(),
        })
}

/// Stop containers left behind by a previous process. Returns how many were stopped.
pub async fn cleanup_orphans(runtime: &str) -> anyhow::Result<usize> {
    let filter = format!("name={}", CONTAINER_PREFIX);
    let listing = run_command(runtime, &["ps", "--filter", &filter, "--format", "{{.Names}}"]).await?;
    let names: Vec<&str> = listing
        .lines()
        .map(str::trim)
        .filter(|n| n.starts_with(CONTAINER_PREFIX))
        .collect();
    let mut stopped = 0;
    for name in &names {
        match run_command(runtime, &["stop", name]).await {
            Ok(_) => stopped += 1,
            Err(e) => warn!(container = name, error = %e, "failed to stop orphaned container"),
        }
    }
    if stopped > 0 {
        info!(count = stopped, "stopped orphaned containers");
    }
    Ok(stopped)
}

/// Container names are `clawrelay-<folder>-<millis>`.
pub fn container_name(folder: &str) -> String {
    let safe: String = folder
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("{}{}-{}", CONTAINER_PREFIX, safe, Utc::now().timestamp_millis())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub readonly: bool,
}

impl Mount {
    fn new(host: PathBuf, container: &str, readonly: bool) -> Self {
        Self {
            host,
            container: container.to_string(),
            readonly,
        }
    }

    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.readonly {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Filter a registration's extra mounts: the host path must be absolute,
/// sit under an allowed root, and avoid credential directories. Mounts of
/// non-privileged identities are always read-only.
pub fn validate_additional_mounts(
    mounts: &[AdditionalMount],
    allowlist: &[String],
    is_main: bool,
) -> Vec<Mount> {
    let mut accepted = Vec::new();
    for mount in mounts {
        let host = PathBuf::from(&mount.host_path);
        let allowed = host.is_absolute()
            && !host.components().any(|c| matches!(c, Component::ParentDir))
            && allowlist.iter().any(|root| host.starts_with(root))
            && !host.components().any(|c| {
                BLOCKED_MOUNT_COMPONENTS
                    .iter()
                    .any(|blocked| c.as_os_str() == *blocked)
            });
        let name = mount
            .container_path
            .clone()
            .or_else(|| host.file_name().map(|n| n.to_string_lossy().to_string()))
            .unwrap_or_default();
        let name_ok = !name.is_empty()
            && !name.contains('/')
            && !name.contains("..")
            && name != ".";
        if !allowed || !name_ok {
            warn!(host = %mount.host_path, "rejected additional mount");
            continue;
        }
        accepted.push(Mount::new(
            host,
            &format!("/workspace/extra/{}", name),
            mount.readonly || !is_main,
        ));
    }
    accepted
}

/// Launches each agent run as `<runtime> run -i --rm` with the identity's
/// folders mounted, speaking NDJSON over stdio.
pub struct ContainerRunner {
    paths: Paths,
    settings: ContainerSettings,
    main_folder: String,
    project_root: PathBuf,
    secret_vars: Vec<String>,
}

impl ContainerRunner {
    pub fn new(
        paths: Paths,
        settings: ContainerSettings,
        main_folder: String,
        project_root: PathBuf,
        secret_vars: Vec<String>,
    ) -> Self {
        Self {
            paths,
            settings,
            main_folder,
            project_root,
            secret_vars,
        }
    }

    pub fn mounts(&self, group: &RegisteredGroup, secrets_file: Option<&Path>) -> Vec<Mount> {
        let folder = &group.folder;
        let is_main = *folder == self.main_folder;
        let mut mounts = vec![
            Mount::new(self.paths.group_dir(folder), "/workspace/group", false),
            Mount::new(self.paths.group_ipc_dir(folder), "/workspace/ipc", false),
            Mount::new(self.paths.group_session_dir(folder), "/home/node/.claude", false),
        ];
        if is_main {
            mounts.push(Mount::new(self.project_root.clone(), "/workspace/project", true));
        }
        if let Some(secrets) = secrets_file {
            mounts.push(Mount::new(secrets.to_path_buf(), "/run/secrets/agent.json", true));
        }
        if let Some(config) = &group.container_config {
            mounts.extend(validate_additional_mounts(
                &config.additional_mounts,
                &self.settings.mount_allowlist,
                is_main,
            ));
        }
        mounts
    }

    pub fn build_args(&self, name: &str, mounts: &[Mount]) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-i".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        if let Ok(tz) = std::env::var("TZ") {
            args.push("-e".to_string());
            args.push(format!("TZ={}", tz));
        }
        for mount in mounts {
            args.push("-v".to_string());
            args.push(mount.to_arg());
        }
        args.push(self.settings.image.clone());
        args
    }

    /// Write forwarded secrets to a 0600 file; None when nothing is configured.
    fn write_secrets(&self, name: &str) -> anyhow::Result<Option<PathBuf>> {
        let secrets: serde_json::Map<String, serde_json::Value> = self
            .secret_vars
            .iter()
            .filter_map(|var| std::env::var(var).ok().map(|v| (var.clone(), v.into())))
            .collect();
        if secrets.is_empty() {
            return Ok(None);
        }
        let dir = self.paths.data_dir.join("secrets");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", name));
        let mut options = std::fs::OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path)?;
        file.write_all(serde_json::to_string(&secrets)?.as_bytes())?;
        Ok(Some(path))
    }

    fn hard_timeout(&self, group: &RegisteredGroup, idle: Duration) -> Duration {
        let configured = group
            .container_config
            .as_ref()
            .and_then(|c| c.timeout_ms)
            .unwrap_or(self.settings.timeout_ms);
        Duration::from_millis(configured).max(idle + HARD_TIMEOUT_SLACK)
    }
}

impl AgentRunner for ContainerRunner {
    fn start(&self, request: RunRequest) -> Result<AgentRun, RunnerError> {
        let folder = request.group.folder.clone();
        self.paths.ensure_group_dirs(&folder)?;

        let name = container_name(&folder);
        let secrets_file = self.write_secrets(&name)?;
        let mounts = self.mounts(&request.group, secrets_file.as_deref());
        let args = self.build_args(&name, &mounts);
        let input_line = serde_json::to_string(&request.input)?;

        debug!(group = %folder, container = %name, args = ?args, "spawning agent container");
        let mut child = Command::new(&self.settings.runtime)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if let Some(path) = &secrets_file {
                    let _ = std::fs::remove_file(path);
                }
                RunnerError::Spawn(e)
            })?;

        let (handle, endpoint) = ProcessHandle::new(name.clone());
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outcome_tx, outcome_rx) = oneshot::channel();

        let stdin = child.stdin.take();
        let supervisor = Supervisor {
            runtime: self.settings.runtime.clone(),
            name,
            folder,
            logs_dir: self.paths.group_logs_dir(&request.group.folder),
            secrets_file,
            hard_timeout: self.hard_timeout(&request.group, request.idle_timeout),
            max_output_bytes: self.settings.max_output_bytes,
            input: request.input,
        };
        tokio::spawn(supervisor.run(child, stdin, input_line, endpoint, event_tx, outcome_tx));

        Ok(AgentRun {
            handle,
            events: event_rx,
            outcome: outcome_rx,
        })
    }
}

struct Supervisor {
    runtime: String,
    name: String,
    folder: String,
    logs_dir: PathBuf,
    secrets_file: Option<PathBuf>,
    hard_timeout: Duration,
    max_output_bytes: usize,
    input: AgentInput,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        stdin: Option<ChildStdin>,
        input_line: String,
        endpoint: ProcessEndpoint,
        events: mpsc::Sender<AgentEvent>,
        outcome_tx: oneshot::Sender<RunOutcome>,
    ) {
        let started = Instant::now();
        let ProcessEndpoint {
            stdin: stdin_rx,
            mut control,
            stdin_closed,
        } = endpoint;

        let writer = tokio::spawn(write_stdin(stdin, input_line, stdin_rx));
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(read_capped(stderr, self.max_output_bytes)));

        let mut timed_out = false;
        let mut last_error: Option<String> = None;
        let mut event_count = 0usize;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            let deadline = tokio::time::sleep(self.hard_timeout);
            tokio::pin!(deadline);
            let mut control_open = true;

            loop {
                tokio::select! {
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => match parse_event_line(&line) {
                            Some(event) => {
                                event_count += 1;
                                deadline.as_mut().reset(tokio::time::Instant::now() + self.hard_timeout);
                                last_error = if event.is_error() {
                                    Some(event.error.clone().unwrap_or_else(|| "agent reported an error".to_string()))
                                } else {
                                    None
                                };
                                if events.send(event).await.is_err() {
                                    debug!(container = %self.name, "event receiver dropped");
                                }
                            }
                            None => debug!(container = %self.name, "agent: {}", line),
                        },
                        Ok(None) => break,
                        Err(e) => {
                            warn!(container = %self.name, error = %e, "failed reading agent stdout");
                            break;
                        }
                    },
                    ctl = control.recv(), if control_open => match ctl {
                        Some(ProcessControl::Terminate) => {
                            info!(container = %self.name, "stopping container");
                            spawn_stop(&self.runtime, &self.name);
                        }
                        Some(ProcessControl::Kill) => {
                            warn!(container = %self.name, "killing container");
                            spawn_kill(&self.runtime, &self.name);
                            let _ = child.start_kill();
                        }
                        None => control_open = false,
                    },
                    _ = &mut deadline => {
                        warn!(container = %self.name, timeout_ms = self.hard_timeout.as_millis() as u64, "agent timed out");
                        timed_out = true;
                        spawn_stop(&self.runtime, &self.name);
                        break;
                    }
                }
            }
        }
        // Stdout is done, so the agent is exiting: refuse further input
        // before the events channel reports the end of the run.
        stdin_closed.store(true, Ordering::SeqCst);
        writer.abort();
        drop(events);

        let status = match tokio::time::timeout(
            Duration::from_secs(u64::from(STOP_GRACE_SECS) + 5),
            child.wait(),
        )
        .await
        {
            Ok(Ok(status)) => status.code(),
            Ok(Err(e)) => {
                warn!(container = %self.name, error = %e, "failed to wait for container");
                None
            }
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                None
            }
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };

        if let Some(path) = &self.secrets_file {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to remove secrets file");
            }
        }

        let outcome = if timed_out {
            RunOutcome::TimedOut
        } else if status != Some(0) {
            RunOutcome::Failed(format!(
                "container exited with code {}",
                status.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string())
            ))
        } else if let Some(err) = last_error {
            RunOutcome::Failed(err)
        } else {
            RunOutcome::Success
        };

        let duration = started.elapsed();
        info!(
            group = %self.folder,
            container = %self.name,
            duration_ms = duration.as_millis() as u64,
            exit_code = ?status,
            events = event_count,
            outcome = ?outcome,
            "agent run finished"
        );
        if let Err(e) = self.write_run_log(duration, status, &outcome, &stderr) {
            warn!(group = %self.folder, error = %e, "failed to write run log");
        }
        let _ = outcome_tx.send(outcome);
    }

    fn write_run_log(
        &self,
        duration: Duration,
        status: Option<i32>,
        outcome: &RunOutcome,
        stderr: &str,
    ) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.logs_dir)?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let path = self.logs_dir.join(format!("container-{}.log", stamp));
        let mut body = String::new();
        body.push_str(&format!("=== Agent Run {} ===\n", self.name));
        body.push_str(&format!("Timestamp: {}\n", Utc::now().to_rfc3339()));
        body.push_str(&format!("Group: {}\n", self.folder));
        body.push_str(&format!("Main: {}\n", self.input.is_main));
        body.push_str(&format!("Scheduled task: {}\n", self.input.is_scheduled_task));
        body.push_str(&format!(
            "Session: {}\n",
            self.input.session_id.as_deref().unwrap_or("new")
        ));
        body.push_str(&format!("Prompt length: {} chars\n", self.input.prompt.len()));
        body.push_str(&format!("Duration: {}ms\n", duration.as_millis()));
        body.push_str(&format!("Exit code: {:?}\n", status));
        body.push_str(&format!("Outcome: {:?}\n", outcome));
        if !stderr.is_empty() {
            body.push_str("\n=== Stderr ===\n");
            body.push_str(stderr);
            body.push('\n');
        }
        std::fs::write(path, body)
    }
}

async fn write_stdin(
    stdin: Option<ChildStdin>,
    input_line: String,
    mut commands: mpsc::UnboundedReceiver<StdinCommand>,
) {
    let Some(mut stdin) = stdin else {
        return;
    };
    if write_line(&mut stdin, &input_line).await.is_err() {
        return;
    }
    while let Some(cmd) = commands.recv().await {
        match cmd {
            StdinCommand::Message { text, ack } => {
                let line = serde_json::json!({ "type": "message", "text": text }).to_string();
                let ok = write_line(&mut stdin, &line).await.is_ok();
                let _ = ack.send(ok);
                if !ok {
                    return;
                }
            }
            StdinCommand::Close => {
                let _ = stdin.shutdown().await;
                return;
            }
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn read_capped(mut stderr: tokio::process::ChildStderr, cap: usize) -> String {
    let mut kept = Vec::new();
    let mut buf = [0u8; 8192];
    let mut truncated = false;
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = cap.saturating_sub(kept.len());
                if room < n {
                    truncated = true;
                }
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    let mut text = String::from_utf8_lossy(&kept).to_string();
    if truncated {
        text.push_str("\n[stderr truncated]");
    }
    text
}

fn spawn_stop(runtime: &str, name: &str) {
    let runtime = runtime.to_string();
    let name = name.to_string();
    tokio::spawn(async move {
        let grace = STOP_GRACE_SECS.to_string();
        if let Err(e) = run_command(&runtime, &["stop", "-t", &grace, &name]).await {
            debug!(container = %name, error = %e, "stop failed");
        }
    });
}

fn spawn_kill(runtime: &str, name: &str) {
    let runtime = runtime.to_string();
    let name = name.to_string();
    tokio::spawn(async move {
        if let Err(e) = run_command(&runtime, &["kill", &name]).await {
            debug!(container = %name, error = %e, "kill failed");
        }
    });
}
