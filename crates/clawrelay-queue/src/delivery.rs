use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use clawrelay_core::channel::ChannelRegistry;
use clawrelay_core::config::Paths;
use clawrelay_core::logging::preview;
use clawrelay_core::router::{batch_has_trigger, format_messages, format_outbound};
use clawrelay_core::store::Store;
use clawrelay_core::types::{
    now_iso, ContextMode, RegisteredGroup, RunStatus, ScheduledTask, Settings,
};

use crate::group_queue::{GroupQueue, JobFuture};
use crate::runner::{AgentInput, AgentRun, AgentRunner, RunOutcome, RunRequest};
use crate::state::RouterState;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub assistant_name: String,
    pub main_folder: String,
    pub poll_interval: Duration,
    pub idle_timeout: Duration,
}

impl EngineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            assistant_name: settings.assistant_name.clone(),
            main_folder: settings.main_group_folder.clone(),
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            idle_timeout: Duration::from_millis(settings.idle_timeout_ms),
        }
    }
}

/// Result of one scheduled task run, before bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

struct RunSpec {
    group: RegisteredGroup,
    chat_jid: String,
    prompt: String,
    session_id: Option<String>,
    scheduled: bool,
    persist_session: bool,
}

#[derive(Debug, Default)]
struct RunReport {
    outcome: Option<RunOutcome>,
    output_relayed: bool,
    last_result: Option<String>,
    error: Option<String>,
}

impl RunReport {
    fn failed(reason: String) -> Self {
        Self {
            outcome: Some(RunOutcome::Failed(reason.clone())),
            error: Some(reason),
            ..Self::default()
        }
    }

    fn is_success(&self) -> bool {
        self.outcome.as_ref().is_some_and(RunOutcome::is_success)
    }

    fn failure_reason(&self) -> String {
        match &self.outcome {
            Some(RunOutcome::Failed(reason)) => reason.clone(),
            Some(RunOutcome::TimedOut) => "agent timed out".to_string(),
            Some(RunOutcome::Success) => self.error.clone().unwrap_or_default(),
            None => "agent outcome unknown".to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSnapshot<'a> {
    id: &'a str,
    group_folder: &'a str,
    prompt: &'a str,
    schedule_type: &'a str,
    schedule_value: &'a str,
    status: &'a str,
    next_run: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AvailableGroup {
    jid: String,
    name: String,
    last_activity: String,
    is_registered: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GroupsSnapshot {
    groups: Vec<AvailableGroup>,
    last_sync: String,
}

struct EngineInner {
    store: Store,
    state: RouterState,
    queue: GroupQueue,
    runner: Arc<dyn AgentRunner>,
    channels: ChannelRegistry,
    config: EngineConfig,
    paths: Paths,
}

/// Moves stored messages to agents and agent output back to chats.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Builds the engine and installs it as the queue's message processor.
    pub fn new(
        state: RouterState,
        queue: GroupQueue,
        runner: Arc<dyn AgentRunner>,
        channels: ChannelRegistry,
        config: EngineConfig,
        paths: Paths,
    ) -> Self {
        let inner = Arc::new(EngineInner {
            store: state.store().clone(),
            state,
            queue,
            runner,
            channels,
            config,
            paths,
        });
        let weak: Weak<EngineInner> = Arc::downgrade(&inner);
        inner.queue.set_processor(Arc::new(move |folder: String| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(inner) => Engine { inner }.process_group_messages(&folder).await,
                    None => true,
                }
            }) as JobFuture
        }));
        Self { inner }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    pub fn state(&self) -> &RouterState {
        &self.inner.state
    }

    pub fn queue(&self) -> &GroupQueue {
        &self.inner.queue
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.inner.channels
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn paths(&self) -> &Paths {
        &self.inner.paths
    }

    pub fn is_main(&self, folder: &str) -> bool {
        folder == self.inner.config.main_folder
    }

    fn needs_trigger(&self, group: &RegisteredGroup) -> bool {
        group.requires_trigger && !self.is_main(&group.folder)
    }

    /// Pick up newly stored messages and route them. Returns how many were seen.
    pub async fn poll_once(&self) -> Result<usize> {
        let state = &self.inner.state;
        let jids = state.registered_jids();
        if jids.is_empty() {
            return Ok(0);
        }
        let messages = self
            .inner
            .store
            .new_messages(&jids, state.last_seq())
            .context("failed to load new messages")?;
        let Some(newest) = messages.last() else {
            return Ok(0);
        };
        state.advance_observed(newest.seq)?;
        info!(count = messages.len(), "new messages");

        let affected: BTreeSet<&str> = messages.iter().map(|m| m.chat_jid.as_str()).collect();
        for jid in affected {
            for group in state.groups_for_jid(jid) {
                if let Err(e) = self.route_to_group(&group).await {
                    error!(group = %group.folder, error = %e, "failed to route messages");
                }
            }
        }
        Ok(messages.len())
    }

    /// Pipe into a live message run when there is one, otherwise queue a recheck.
    async fn route_to_group(&self, group: &RegisteredGroup) -> Result<()> {
        let folder = &group.folder;
        let queue = &self.inner.queue;
        let state = &self.inner.state;

        if queue.has_message_run(folder) {
            let since = state
                .coverage(folder)
                .unwrap_or_else(|| state.agent_cursor(folder));
            let pending = self
                .inner
                .store
                .messages_since(&group.jid, since, state.last_seq())?;
            let Some(last) = pending.last() else {
                return Ok(());
            };
            if self.needs_trigger(group) && !batch_has_trigger(&pending, &group.trigger) {
                debug!(group = %folder, count = pending.len(), "no trigger, holding as context");
                return Ok(());
            }
            let coverage = last.seq;
            if queue.send_message(folder, format_messages(&pending)).await {
                state.extend_coverage(folder, coverage);
                debug!(group = %folder, count = pending.len(), "piped messages into live agent");
                self.inner.channels.set_typing(&group.jid, true).await;
                return Ok(());
            }
            debug!(group = %folder, "live agent not accepting input");
        }
        queue.enqueue_message_check(folder);
        Ok(())
    }

    /// Queue processor: dispatch everything beyond the cursor for one
    /// identity. False asks the queue to retry later.
    pub async fn process_group_messages(&self, folder: &str) -> bool {
        let state = &self.inner.state;
        let Some(group) = state.group(folder) else {
            debug!(group = folder, "group no longer registered");
            return true;
        };

        let previous = state.agent_cursor(folder);
        let batch = match self
            .inner
            .store
            .messages_since(&group.jid, previous, state.last_seq())
        {
            Ok(batch) => batch,
            Err(e) => {
                error!(group = folder, error = %e, "failed to load pending messages");
                return false;
            }
        };
        let Some(last) = batch.last() else {
            return true;
        };
        if self.needs_trigger(&group) && !batch_has_trigger(&batch, &group.trigger) {
            debug!(group = folder, count = batch.len(), "no trigger in batch");
            return true;
        }

        info!(group = folder, count = batch.len(), "dispatching messages to agent");
        state.begin_run(folder, last.seq);
        let report = self
            .drive_run(RunSpec {
                chat_jid: group.jid.clone(),
                prompt: format_messages(&batch),
                session_id: state.session(folder),
                scheduled: false,
                persist_session: true,
                group,
            })
            .await;
        let coverage = state.end_run(folder);

        if report.is_success() || report.output_relayed {
            if !report.is_success() {
                warn!(
                    group = folder,
                    reason = %report.failure_reason(),
                    "agent failed after output was relayed, not retrying"
                );
            }
            if let Some(coverage) = coverage {
                if let Err(e) = state.advance_agent_cursor(folder, coverage) {
                    error!(group = folder, error = %e, "failed to persist agent cursor");
                }
            }
            return true;
        }

        warn!(group = folder, reason = %report.failure_reason(), "agent run failed, rolling back");
        if let Err(e) = state.rollback_agent_cursor(folder, previous) {
            error!(group = folder, error = %e, "failed to roll back agent cursor");
        }
        false
    }

    /// Run a scheduled task inside its queue slot.
    pub async fn run_task(&self, task: &ScheduledTask) -> TaskOutcome {
        let started = Instant::now();
        let Some(group) = self.inner.state.group(&task.group_folder) else {
            warn!(task_id = %task.id, group = %task.group_folder, "task group not registered");
            return TaskOutcome {
                status: RunStatus::Error,
                result: None,
                error: Some(format!("group not registered: {}", task.group_folder)),
                duration_ms: started.elapsed().as_millis() as u64,
            };
        };

        let session_id = match task.context_mode {
            ContextMode::Group => self.inner.state.session(&group.folder),
            ContextMode::Isolated => None,
        };
        info!(task_id = %task.id, group = %group.folder, "running scheduled task");
        let report = self
            .drive_run(RunSpec {
                chat_jid: task.chat_jid.clone(),
                prompt: task.prompt.clone(),
                session_id,
                scheduled: true,
                persist_session: task.context_mode == ContextMode::Group,
                group,
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        if report.is_success() {
            TaskOutcome {
                status: RunStatus::Success,
                result: report.last_result,
                error: None,
                duration_ms,
            }
        } else {
            TaskOutcome {
                status: RunStatus::Error,
                error: Some(report.failure_reason()),
                result: report.last_result,
                duration_ms,
            }
        }
    }

    async fn drive_run(&self, spec: RunSpec) -> RunReport {
        let folder = spec.group.folder.clone();
        let is_main = self.is_main(&folder);
        if let Err(e) = self.write_snapshots(&folder) {
            warn!(group = %folder, error = %e, "failed to write snapshots");
        }

        let input = AgentInput {
            prompt: spec.prompt,
            session_id: spec.session_id,
            group_folder: folder.clone(),
            chat_jid: spec.chat_jid.clone(),
            is_main,
            is_scheduled_task: spec.scheduled,
            assistant_name: self.inner.config.assistant_name.clone(),
        };
        let idle_timeout = self.inner.config.idle_timeout;
        let AgentRun {
            handle,
            mut events,
            outcome,
        } = match self.inner.runner.start(RunRequest {
            group: spec.group,
            input,
            idle_timeout,
        }) {
            Ok(run) => run,
            Err(e) => {
                error!(group = %folder, error = %e, "failed to start agent");
                return RunReport::failed(e.to_string());
            }
        };

        let queue = &self.inner.queue;
        let channels = &self.inner.channels;
        let state = &self.inner.state;
        let jid = spec.chat_jid;
        queue.register_process(&folder, handle);
        channels.set_typing(&jid, true).await;

        let mut report = RunReport::default();
        // Armed only after the first relayable output.
        let idle = tokio::time::sleep(idle_timeout);
        tokio::pin!(idle);
        let mut idle_armed = false;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Some(session_id) = event.new_session_id.as_deref() {
                        if spec.persist_session {
                            if let Err(e) = state.set_session(&folder, session_id) {
                                error!(group = %folder, error = %e, "failed to persist session");
                            }
                        }
                    }
                    if event.is_error() {
                        report.error = event.error.clone();
                    }
                    match event.result.as_deref() {
                        Some(raw) => {
                            let Some(text) = format_outbound(raw) else {
                                debug!(group = %folder, "agent output was internal only");
                                continue;
                            };
                            match channels.send_message(&jid, &text).await {
                                Ok(()) => {
                                    info!(group = %folder, "relayed: {}", preview(&text, 80));
                                    // Relayed output is never sent twice: move the cursor now.
                                    if let Some(coverage) = state.coverage(&folder).filter(|_| !spec.scheduled) {
                                        if let Err(e) = state.advance_agent_cursor(&folder, coverage) {
                                            error!(group = %folder, error = %e, "failed to persist agent cursor");
                                        }
                                    }
                                    report.output_relayed = true;
                                    report.last_result = Some(text);
                                    idle.as_mut().reset(tokio::time::Instant::now() + idle_timeout);
                                    idle_armed = true;
                                }
                                Err(e) => error!(group = %folder, error = %e, "failed to relay agent output"),
                            }
                        }
                        None => {
                            channels.set_typing(&jid, false).await;
                            queue.notify_idle(&folder);
                            if spec.scheduled {
                                queue.close_stdin(&folder);
                            }
                        }
                    }
                }
                _ = &mut idle, if idle_armed => {
                    info!(group = %folder, "agent idle, closing stdin");
                    queue.close_stdin(&folder);
                    idle_armed = false;
                }
            }
        }
        // Output ended: the process is exiting and accepts no more input.
        queue.close_stdin(&folder);

        report.outcome = Some(
            outcome
                .await
                .unwrap_or_else(|_| RunOutcome::Failed("agent runner dropped".to_string())),
        );
        channels.set_typing(&jid, false).await;
        report
    }

    /// Recheck every identity with messages beyond its cursor.
    pub fn recover_pending(&self) -> Result<usize> {
        let state = &self.inner.state;
        let until = state.last_seq();
        let mut recovered = 0;
        for group in state.groups() {
            let pending =
                self.inner
                    .store
                    .messages_since(&group.jid, state.agent_cursor(&group.folder), until)?;
            if !pending.is_empty() {
                info!(group = %group.folder, count = pending.len(), "recovering unprocessed messages");
                self.inner.queue.enqueue_message_check(&group.folder);
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Write `current_tasks.json` and `available_groups.json` into the
    /// identity's mailbox. Only the privileged identity sees other groups.
    pub fn write_snapshots(&self, folder: &str) -> Result<()> {
        let dir = self.inner.paths.group_ipc_dir(folder);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let is_main = self.is_main(folder);

        let tasks = self.inner.store.all_tasks()?;
        let snapshots: Vec<TaskSnapshot> = tasks
            .iter()
            .filter(|t| is_main || t.group_folder == folder)
            .map(|t| TaskSnapshot {
                id: &t.id,
                group_folder: &t.group_folder,
                prompt: &t.prompt,
                schedule_type: t.schedule_type.as_str(),
                schedule_value: &t.schedule_value,
                status: t.status.as_str(),
                next_run: t.next_run.as_deref(),
            })
            .collect();
        std::fs::write(
            dir.join("current_tasks.json"),
            serde_json::to_string_pretty(&snapshots)?,
        )?;

        let groups = if is_main {
            let registered: BTreeSet<String> = self.inner.state.registered_jids().into_iter().collect();
            self.inner
                .store
                .all_chats()?
                .into_iter()
                .map(|c| AvailableGroup {
                    is_registered: registered.contains(&c.jid),
                    jid: c.jid,
                    name: c.name,
                    last_activity: c.last_message_time,
                })
                .collect()
        } else {
            Vec::new()
        };
        std::fs::write(
            dir.join("available_groups.json"),
            serde_json::to_string_pretty(&GroupsSnapshot {
                groups,
                last_sync: now_iso(),
            })?,
        )?;
        Ok(())
    }

    /// Poll for new messages until `shutdown` flips to true.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            "message loop started"
        );
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "message poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("message loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use clawrelay_core::channel::{Channel, InboundSender};
    use clawrelay_core::types::{NewMessage, ScheduleType, TaskStatus};
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot};

    use crate::group_queue::{ProcessHandle, StdinCommand};
    use crate::runner::{AgentEvent, EventStatus, RunnerError};

    struct Script {
        events: Vec<AgentEvent>,
        outcome: RunOutcome,
        /// Keep the run open until the queue stops or kills it.
        hold: bool,
    }

    #[derive(Default)]
    struct FakeRunner {
        scripts: Mutex<VecDeque<Script>>,
        inputs: Mutex<Vec<AgentInput>>,
    }

    impl FakeRunner {
        fn push(&self, events: Vec<AgentEvent>, outcome: RunOutcome) {
            self.scripts.lock().unwrap().push_back(Script {
                events,
                outcome,
                hold: false,
            });
        }

        fn push_held(&self, events: Vec<AgentEvent>) {
            self.scripts.lock().unwrap().push_back(Script {
                events,
                outcome: RunOutcome::Failed("terminated".to_string()),
                hold: true,
            });
        }

        fn calls(&self) -> usize {
            self.inputs.lock().unwrap().len()
        }

        fn input(&self, n: usize) -> AgentInput {
            self.inputs.lock().unwrap()[n].clone()
        }
    }

    impl AgentRunner for FakeRunner {
        fn start(&self, request: RunRequest) -> Result<AgentRun, RunnerError> {
            self.inputs.lock().unwrap().push(request.input);
            let script = self.scripts.lock().unwrap().pop_front().unwrap_or(Script {
                events: vec![ok(None)],
                outcome: RunOutcome::Success,
                hold: false,
            });
            let (handle, endpoint) = ProcessHandle::new("fake");
            let (tx, rx) = mpsc::channel(16);
            let (done_tx, done_rx) = oneshot::channel();
            tokio::spawn(async move {
                let mut endpoint = endpoint;
                for event in script.events {
                    let _ = tx.send(event).await;
                }
                while script.hold {
                    tokio::select! {
                        _ = endpoint.control.recv() => break,
                        cmd = endpoint.stdin.recv() => match cmd {
                            Some(StdinCommand::Message { ack, .. }) => {
                                let _ = ack.send(true);
                            }
                            Some(StdinCommand::Close) | None => break,
                        },
                    }
                }
                drop(tx);
                let _ = done_tx.send(script.outcome);
            });
            Ok(AgentRun {
                handle,
                events: rx,
                outcome: done_rx,
            })
        }
    }

    #[derive(Default)]
    struct FakeChannel {
        sent: Mutex<Vec<(String, String)>>,
        failing: AtomicBool,
    }

    impl FakeChannel {
        fn texts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, t)| t.clone()).collect()
        }
    }

    #[async_trait]
    impl Channel for FakeChannel {
        fn name(&self) -> &str {
            "fake"
        }

        async fn connect(&self, _inbound: InboundSender) -> Result<()> {
            Ok(())
        }

        async fn send_message(&self, jid: &str, text: &str) -> Result<()> {
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("platform unavailable");
            }
            self.sent.lock().unwrap().push((jid.to_string(), text.to_string()));
            Ok(())
        }

        fn owns_jid(&self, jid: &str) -> bool {
            jid.starts_with("tg:")
        }

        fn is_connected(&self) -> bool {
            true
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn ok(result: Option<&str>) -> AgentEvent {
        AgentEvent {
            status: EventStatus::Ok,
            result: result.map(str::to_string),
            new_session_id: None,
            error: None,
        }
    }

    struct Harness {
        _tmp: TempDir,
        engine: Engine,
        runner: Arc<FakeRunner>,
        channel: Arc<FakeChannel>,
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::from_settings(&Settings::default()))
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(FakeRunner::default());
        let (engine, channel) = engine_with(runner.clone(), tmp.path(), config);
        Harness {
            _tmp: tmp,
            engine,
            runner,
            channel,
        }
    }

    fn engine_with(
        runner: Arc<dyn AgentRunner>,
        home: &std::path::Path,
        config: EngineConfig,
    ) -> (Engine, Arc<FakeChannel>) {
        let store = Store::open_in_memory().unwrap();
        let state = RouterState::load(store).unwrap();
        for (folder, jid) in [("family", "tg:1"), ("main", "tg:0")] {
            state
                .register_group(RegisteredGroup {
                    jid: jid.to_string(),
                    name: folder.to_string(),
                    folder: folder.to_string(),
                    trigger: "@Andy".to_string(),
                    requires_trigger: true,
                    added_at: "2024-01-01T00:00:00.000Z".to_string(),
                    container_config: None,
                })
                .unwrap();
        }
        let channel = Arc::new(FakeChannel::default());
        let mut channels = ChannelRegistry::new();
        channels.add(channel.clone());
        let engine = Engine::new(
            state,
            GroupQueue::with_retry_base(5, Duration::from_millis(10)),
            runner,
            channels,
            config,
            Paths::from_home(home.to_path_buf()),
        );
        (engine, channel)
    }

    fn inbound(engine: &Engine, jid: &str, id: &str, content: &str, ts: &str) {
        engine
            .store()
            .store_message(&NewMessage {
                id: id.to_string(),
                chat_jid: jid.to_string(),
                sender: "u1".to_string(),
                sender_name: "Alice".to_string(),
                content: content.to_string(),
                timestamp: ts.to_string(),
                is_from_me: false,
                is_bot_message: false,
                seq: 0,
            })
            .unwrap();
    }

    async fn wait_for(mut done: impl FnMut() -> bool) {
        for _ in 0..500 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn settle(h: &Harness, calls: usize) {
        for _ in 0..300 {
            if h.runner.calls() >= calls && h.engine.queue().active_count() == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if h.engine.queue().active_count() == 0 {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("engine did not settle after {} calls", calls);
    }

    #[tokio::test]
    async fn test_triggered_batch_is_dispatched() {
        let h = harness();
        h.runner.push(vec![ok(Some("Hi Alice")), ok(None)], RunOutcome::Success);
        inbound(&h.engine, "tg:1", "m1", "hello everyone", "2024-01-01T00:00:01.000Z");
        inbound(&h.engine, "tg:1", "m2", "@Andy what's up", "2024-01-01T00:00:02.000Z");

        assert_eq!(h.engine.poll_once().await.unwrap(), 2);
        settle(&h, 1).await;

        let input = h.runner.input(0);
        assert!(input.prompt.contains("hello everyone"));
        assert!(input.prompt.contains("@Andy what's up"));
        assert!(!input.is_main);
        assert_eq!(h.channel.texts(), vec!["Hi Alice"]);
        assert_eq!(h.engine.state().agent_cursor("family"), 2);
    }

    #[tokio::test]
    async fn test_untriggered_messages_wait_for_trigger() {
        let h = harness();
        inbound(&h.engine, "tg:1", "m1", "just chatting", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        settle(&h, 0).await;
        assert_eq!(h.runner.calls(), 0);
        assert_eq!(h.engine.state().agent_cursor("family"), 0);
        assert_eq!(h.engine.state().last_seq(), 1);

        inbound(&h.engine, "tg:1", "m2", "@andy summarize", "2024-01-01T00:00:05.000Z");
        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;
        let prompt = h.runner.input(0).prompt;
        assert!(prompt.contains("just chatting"));
        assert!(prompt.contains("summarize"));
    }

    #[tokio::test]
    async fn test_main_group_skips_trigger() {
        let h = harness();
        inbound(&h.engine, "tg:0", "m1", "list my tasks", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;
        assert!(h.runner.input(0).is_main);
    }

    #[tokio::test]
    async fn test_failure_without_output_rolls_back_and_retries() {
        let h = harness();
        h.runner
            .push(Vec::new(), RunOutcome::Failed("exit 1".to_string()));
        h.runner.push(vec![ok(Some("done"))], RunOutcome::Success);
        inbound(&h.engine, "tg:1", "m1", "@Andy do it", "2024-01-01T00:00:01.000Z");

        h.engine.poll_once().await.unwrap();
        settle(&h, 2).await;

        assert_eq!(h.runner.input(0).prompt, h.runner.input(1).prompt);
        assert_eq!(h.channel.texts(), vec!["done"]);
        assert_eq!(h.engine.state().agent_cursor("family"), 1);
    }

    #[tokio::test]
    async fn test_partial_output_is_not_resent() {
        let h = harness();
        h.runner.push(
            vec![ok(Some("first half"))],
            RunOutcome::Failed("crashed".to_string()),
        );
        inbound(&h.engine, "tg:1", "m1", "@Andy long task", "2024-01-01T00:00:01.000Z");

        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.runner.calls(), 1);
        assert_eq!(h.channel.texts(), vec!["first half"]);
        assert_eq!(h.engine.state().agent_cursor("family"), 1);
    }

    #[tokio::test]
    async fn test_internal_output_is_not_relayed() {
        let h = harness();
        h.runner.push(
            vec![ok(Some("<internal>thinking</internal>")), ok(Some("<internal>x</internal> Visible"))],
            RunOutcome::Success,
        );
        inbound(&h.engine, "tg:1", "m1", "@Andy hi", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;
        assert_eq!(h.channel.texts(), vec!["Visible"]);
    }

    #[tokio::test]
    async fn test_session_is_persisted_and_reused() {
        let h = harness();
        let mut event = ok(Some("hello"));
        event.new_session_id = Some("sess-1".to_string());
        h.runner.push(vec![event], RunOutcome::Success);
        inbound(&h.engine, "tg:1", "m1", "@Andy hi", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;

        assert_eq!(h.engine.state().session("family").as_deref(), Some("sess-1"));
        assert_eq!(
            h.engine.store().get_session("family").unwrap().as_deref(),
            Some("sess-1")
        );

        inbound(&h.engine, "tg:1", "m2", "@Andy again", "2024-01-01T00:00:02.000Z");
        h.engine.poll_once().await.unwrap();
        settle(&h, 2).await;
        assert_eq!(h.runner.input(1).session_id.as_deref(), Some("sess-1"));
        assert!(!h.runner.input(1).prompt.contains("@Andy hi<"));
    }

    #[tokio::test]
    async fn test_recover_pending_enqueues_once_per_group() {
        let h = harness();
        inbound(&h.engine, "tg:1", "m1", "@Andy are you there", "2024-01-01T00:00:01.000Z");
        h.engine.state().advance_observed(1).unwrap();

        assert_eq!(h.engine.recover_pending().unwrap(), 1);
        settle(&h, 1).await;
        assert_eq!(h.runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_run_task_relays_without_touching_session() {
        let h = harness();
        let mut event = ok(Some("Daily summary"));
        event.new_session_id = Some("task-session".to_string());
        h.runner.push(vec![event, ok(None)], RunOutcome::Success);

        let task = ScheduledTask {
            id: "t1".to_string(),
            group_folder: "family".to_string(),
            chat_jid: "tg:1".to_string(),
            prompt: "Summarize the day".to_string(),
            schedule_type: ScheduleType::Cron,
            schedule_value: "0 9 * * *".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: None,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_iso(),
        };
        let outcome = h.engine.run_task(&task).await;

        assert_eq!(outcome.status, RunStatus::Success);
        assert_eq!(outcome.result.as_deref(), Some("Daily summary"));
        assert!(h.runner.input(0).is_scheduled_task);
        assert!(h.engine.state().session("family").is_none());
        assert_eq!(h.channel.texts(), vec!["Daily summary"]);
    }

    #[tokio::test]
    async fn test_run_task_for_unknown_group_fails() {
        let h = harness();
        let task = ScheduledTask {
            id: "t2".to_string(),
            group_folder: "ghost".to_string(),
            chat_jid: "tg:9".to_string(),
            prompt: "x".to_string(),
            schedule_type: ScheduleType::Once,
            schedule_value: "2030-01-01T00:00:00Z".to_string(),
            context_mode: ContextMode::Isolated,
            next_run: None,
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_iso(),
        };
        let outcome = h.engine.run_task(&task).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert_eq!(h.runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_context_after_trigger_joins_the_batch() {
        let h = harness();
        inbound(&h.engine, "tg:1", "m1", "we need milk", "2024-01-01T00:00:01.000Z");
        inbound(&h.engine, "tg:1", "m2", "@Andy add it to the list", "2024-01-01T00:00:02.000Z");
        inbound(&h.engine, "tg:1", "m3", "and eggs too", "2024-01-01T00:00:03.000Z");

        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;

        assert_eq!(h.runner.calls(), 1);
        let prompt = h.runner.input(0).prompt;
        assert!(prompt.contains("we need milk"));
        assert!(prompt.contains("add it to the list"));
        assert!(prompt.contains("and eggs too"));
        assert_eq!(h.engine.state().agent_cursor("family"), 3);
    }

    #[tokio::test]
    async fn test_same_timestamp_message_after_poll_is_dispatched() {
        let h = harness();
        let ts = "2024-01-01T00:00:01.000Z";
        inbound(&h.engine, "tg:1", "m1", "@Andy first", ts);
        h.engine.poll_once().await.unwrap();
        settle(&h, 1).await;
        assert_eq!(h.engine.state().agent_cursor("family"), 1);

        // Same second, stored after the poll and the run.
        inbound(&h.engine, "tg:1", "m2", "@Andy second", ts);
        assert_eq!(h.engine.poll_once().await.unwrap(), 1);
        settle(&h, 2).await;

        assert_eq!(h.runner.calls(), 2);
        let prompt = h.runner.input(1).prompt;
        assert!(prompt.contains("@Andy second"));
        assert!(!prompt.contains("@Andy first"));
        assert_eq!(h.engine.state().agent_cursor("family"), 2);
    }

    #[tokio::test]
    async fn test_shutdown_without_output_keeps_cursor() {
        let h = harness();
        h.runner.push_held(Vec::new());
        inbound(&h.engine, "tg:1", "m1", "@Andy slow job", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        wait_for(|| h.runner.calls() == 1 && h.engine.queue().has_message_run("family")).await;

        h.engine.queue().shutdown(Duration::from_secs(2)).await;

        assert_eq!(h.engine.queue().active_count(), 0);
        assert!(h.channel.texts().is_empty());
        assert_eq!(h.engine.state().agent_cursor("family"), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_after_output_advances_cursor() {
        let h = harness();
        h.runner.push_held(vec![ok(Some("halfway there"))]);
        inbound(&h.engine, "tg:1", "m1", "@Andy slow job", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        wait_for(|| h.channel.texts() == vec!["halfway there"]).await;

        h.engine.queue().shutdown(Duration::from_secs(2)).await;

        assert_eq!(h.engine.queue().active_count(), 0);
        assert_eq!(h.engine.state().agent_cursor("family"), 1);
    }

    fn short_idle() -> EngineConfig {
        let mut config = EngineConfig::from_settings(&Settings::default());
        config.idle_timeout = Duration::from_millis(100);
        config
    }

    #[tokio::test]
    async fn test_idle_timer_closes_stdin_after_relay() {
        let h = harness_with(short_idle());
        h.runner.push_held(vec![ok(Some("all done"))]);
        inbound(&h.engine, "tg:1", "m1", "@Andy quick one", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();

        wait_for(|| h.channel.texts().len() == 1).await;
        wait_for(|| h.engine.queue().active_count() == 0).await;
    }

    #[tokio::test]
    async fn test_idle_timer_not_armed_by_failed_relay() {
        let h = harness_with(short_idle());
        h.channel.failing.store(true, Ordering::SeqCst);
        h.runner.push_held(vec![ok(Some("never delivered"))]);
        inbound(&h.engine, "tg:1", "m1", "@Andy quick one", "2024-01-01T00:00:01.000Z");
        h.engine.poll_once().await.unwrap();
        wait_for(|| h.runner.calls() == 1 && h.engine.queue().has_message_run("family")).await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(h.engine.queue().has_message_run("family"));
        assert_eq!(h.engine.state().agent_cursor("family"), 0);

        h.engine.queue().shutdown(Duration::from_secs(2)).await;
        assert_eq!(h.engine.state().agent_cursor("family"), 0);
    }

    /// A follow-up arriving while the agent is exiting must start a new run
    /// instead of being written into the dying process.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_message_for_exiting_agent_gets_its_own_run() {
        use std::os::unix::fs::PermissionsExt;

        use clawrelay_core::types::ContainerSettings;

        use crate::runner::ContainerRunner;

        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("fake-runtime");
        std::fs::write(
            &script,
            "#!/bin/sh\nread line\necho '{\"status\":\"ok\",\"result\":\"answer\"}'\nexec 1>&-\nsleep 2\nexit 0\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        let home = tmp.path().join("home");
        let runner = Arc::new(ContainerRunner::new(
            Paths::from_home(home.clone()),
            ContainerSettings {
                runtime: script.to_string_lossy().to_string(),
                ..ContainerSettings::default()
            },
            "main".to_string(),
            tmp.path().to_path_buf(),
            Vec::new(),
        ));
        let (engine, channel) =
            engine_with(runner, &home, EngineConfig::from_settings(&Settings::default()));

        inbound(&engine, "tg:1", "m1", "@Andy first question", "2024-01-01T00:00:01.000Z");
        engine.poll_once().await.unwrap();
        wait_for(|| channel.texts().len() == 1).await;

        // Output has ended; the process lingers before exiting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(engine.queue().has_message_run("family"));
        inbound(&engine, "tg:1", "m2", "@Andy second question", "2024-01-01T00:00:02.000Z");
        engine.poll_once().await.unwrap();
        assert_eq!(engine.state().agent_cursor("family"), 1);

        wait_for(|| channel.texts().len() == 2).await;
        wait_for(|| engine.state().agent_cursor("family") == 2).await;
    }

    #[test]
    fn test_snapshots_scope_by_identity() {
        let h = harness();
        h.engine
            .store()
            .store_chat_metadata("tg:5", "2024-01-01T00:00:00.000Z", Some("Book club"), Some("telegram"))
            .unwrap();
        h.engine.write_snapshots("main").unwrap();
        h.engine.write_snapshots("family").unwrap();

        let read = |folder: &str| -> serde_json::Value {
            let raw = std::fs::read_to_string(
                h.engine.paths().group_ipc_dir(folder).join("available_groups.json"),
            )
            .unwrap();
            serde_json::from_str(&raw).unwrap()
        };
        assert_eq!(read("main")["groups"][0]["name"], "Book club");
        assert_eq!(read("main")["groups"][0]["isRegistered"], false);
        assert!(read("family")["groups"].as_array().unwrap().is_empty());
    }
}
