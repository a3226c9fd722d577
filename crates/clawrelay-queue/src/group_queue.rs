use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, info, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Processes all pending messages for one conversation. Returns false on a
/// failure that should be retried.
pub type MessageProcessor = Arc<dyn Fn(String) -> JobFuture + Send + Sync>;
pub type TaskJob = Box<dyn FnOnce() -> TaskFuture + Send>;

pub const MAX_RETRIES: u32 = 5;
pub const BASE_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Line-level instruction for a live agent's stdin.
#[derive(Debug)]
pub enum StdinCommand {
    /// Write a follow-up message. `ack` reports whether the write reached the pipe.
    Message {
        text: String,
        ack: oneshot::Sender<bool>,
    },
    /// Half-close: no more input is coming.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessControl {
    Terminate,
    Kill,
}

/// Receiving side of a [`ProcessHandle`], owned by whoever drives the process.
pub struct ProcessEndpoint {
    pub stdin: mpsc::UnboundedReceiver<StdinCommand>,
    pub control: mpsc::UnboundedReceiver<ProcessControl>,
    /// Shared with the handle. Set once the process can no longer take input.
    pub stdin_closed: Arc<AtomicBool>,
}

/// Handle to one live agent process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    name: String,
    stdin: mpsc::UnboundedSender<StdinCommand>,
    control: mpsc::UnboundedSender<ProcessControl>,
    stdin_closed: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn new(name: impl Into<String>) -> (Self, ProcessEndpoint) {
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let stdin_closed = Arc::new(AtomicBool::new(false));
        (
            Self {
                name: name.into(),
                stdin: stdin_tx,
                control: control_tx,
                stdin_closed: stdin_closed.clone(),
            },
            ProcessEndpoint {
                stdin: stdin_rx,
                control: control_rx,
                stdin_closed,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stdin_closed(&self) -> bool {
        self.stdin_closed.load(Ordering::SeqCst)
    }

    /// Pipe a follow-up message. False when stdin is closed or the process is gone.
    pub async fn send(&self, text: String) -> bool {
        if self.is_stdin_closed() {
            return false;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .stdin
            .send(StdinCommand::Message { text, ack: ack_tx })
            .is_err()
        {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    pub fn close_stdin(&self) {
        if !self.stdin_closed.swap(true, Ordering::SeqCst) {
            let _ = self.stdin.send(StdinCommand::Close);
        }
    }

    pub fn terminate(&self) {
        let _ = self.control.send(ProcessControl::Terminate);
    }

    pub fn kill(&self) {
        let _ = self.control.send(ProcessControl::Kill);
    }
}

struct QueuedTask {
    id: String,
    job: TaskJob,
}

#[derive(Default)]
struct GroupState {
    active: bool,
    /// The live process has reported completion and is waiting for input.
    idle_waiting: bool,
    is_task_run: bool,
    running_task_id: Option<String>,
    /// Single-slot recheck flag: any number of enqueues collapse into one.
    pending_messages: bool,
    pending_tasks: VecDeque<QueuedTask>,
    process: Option<ProcessHandle>,
    retry_count: u32,
}

#[derive(Default)]
struct QueueState {
    groups: HashMap<String, GroupState>,
    active_count: usize,
    waiting: VecDeque<String>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    processor: OnceLock<MessageProcessor>,
    max_concurrent: usize,
    retry_base: Duration,
    run_finished: Notify,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub active: usize,
    pub waiting: usize,
    pub pending_tasks: usize,
}

/// Serializes agent runs per conversation: at most one live process per key,
/// with later work either piped into it or deferred.
#[derive(Clone)]
pub struct GroupQueue {
    inner: Arc<Inner>,
}

impl GroupQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self::with_retry_base(max_concurrent, BASE_RETRY_DELAY)
    }

    pub fn with_retry_base(max_concurrent: usize, retry_base: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                processor: OnceLock::new(),
                max_concurrent: max_concurrent.max(1),
                retry_base,
                run_finished: Notify::new(),
            }),
        }
    }

    /// Install the message processor. Only the first call has an effect.
    pub fn set_processor(&self, processor: MessageProcessor) {
        if self.inner.processor.set(processor).is_err() {
            warn!("message processor already set, ignoring");
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self, key: &str) -> bool {
        self.lock().groups.get(key).map(|g| g.active).unwrap_or(false)
    }

    /// Whether a message run (not a task run) is live for `key`.
    pub fn has_message_run(&self, key: &str) -> bool {
        self.lock()
            .groups
            .get(key)
            .map(|g| g.active && !g.is_task_run)
            .unwrap_or(false)
    }

    pub fn active_count(&self) -> usize {
        self.lock().active_count
    }

    pub fn stats(&self) -> QueueStats {
        let st = self.lock();
        QueueStats {
            active: st.active_count,
            waiting: st.waiting.len(),
            pending_tasks: st.groups.values().map(|g| g.pending_tasks.len()).sum(),
        }
    }

    /// Ask for the conversation's pending messages to be processed.
    pub fn enqueue_message_check(&self, key: &str) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let at_capacity = st.active_count >= self.inner.max_concurrent;
        let group = st.groups.entry(key.to_string()).or_default();

        if group.active {
            group.pending_messages = true;
            debug!(group = key, "run active, message check deferred");
            return;
        }

        if at_capacity {
            group.pending_messages = true;
            if !st.waiting.iter().any(|k| k == key) {
                st.waiting.push_back(key.to_string());
            }
            debug!(group = key, active = st.active_count, "at concurrency limit, message check queued");
            return;
        }

        self.start_messages(&mut st, key);
    }

    /// Queue a task run. Duplicate ids already queued or running are dropped.
    pub fn enqueue_task(&self, key: &str, task_id: &str, job: TaskJob) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        let at_capacity = st.active_count >= self.inner.max_concurrent;
        let group = st.groups.entry(key.to_string()).or_default();

        if group.running_task_id.as_deref() == Some(task_id)
            || group.pending_tasks.iter().any(|t| t.id == task_id)
        {
            debug!(group = key, task_id, "task already queued, skipping");
            return;
        }

        let task = QueuedTask {
            id: task_id.to_string(),
            job,
        };

        if group.active {
            group.pending_tasks.push_back(task);
            if group.idle_waiting {
                if let Some(process) = &group.process {
                    process.close_stdin();
                }
            }
            debug!(group = key, task_id, "run active, task queued");
            return;
        }

        if at_capacity {
            group.pending_tasks.push_back(task);
            if !st.waiting.iter().any(|k| k == key) {
                st.waiting.push_back(key.to_string());
            }
            debug!(group = key, task_id, "at concurrency limit, task queued");
            return;
        }

        self.start_task(&mut st, key, task);
    }

    pub fn register_process(&self, key: &str, handle: ProcessHandle) {
        let mut st = self.lock();
        let group = st.groups.entry(key.to_string()).or_default();
        group.process = Some(handle);
    }

    /// The live process finished its current work and waits for input.
    /// Queued tasks preempt it.
    pub fn notify_idle(&self, key: &str) {
        let mut st = self.lock();
        let Some(group) = st.groups.get_mut(key) else {
            return;
        };
        group.idle_waiting = true;
        if !group.pending_tasks.is_empty() {
            if let Some(process) = &group.process {
                process.close_stdin();
            }
        }
    }

    /// Pipe text into the live message run for `key`. False means there is no
    /// usable process and the caller should fall back to a recheck.
    pub async fn send_message(&self, key: &str, text: String) -> bool {
        let handle = {
            let st = self.lock();
            if st.shutting_down {
                return false;
            }
            match st.groups.get(key) {
                Some(g) if g.active && !g.is_task_run => g.process.clone(),
                _ => None,
            }
        };
        let Some(handle) = handle else {
            return false;
        };
        let sent = handle.send(text).await;
        if sent {
            if let Some(g) = self.lock().groups.get_mut(key) {
                g.idle_waiting = false;
            }
        }
        sent
    }

    pub fn close_stdin(&self, key: &str) {
        let st = self.lock();
        if let Some(process) = st.groups.get(key).and_then(|g| g.process.as_ref()) {
            process.close_stdin();
        }
    }

    fn start_messages(&self, st: &mut QueueState, key: &str) {
        let group = st.groups.entry(key.to_string()).or_default();
        group.active = true;
        group.idle_waiting = false;
        group.is_task_run = false;
        group.pending_messages = false;
        st.active_count += 1;

        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let processor = queue.inner.processor.get().cloned();
            let ok = match processor {
                Some(process) => process(key.clone()).await,
                None => {
                    warn!(group = %key, "no message processor installed");
                    true
                }
            };
            queue.finish_message_run(&key, ok);
        });
    }

    fn start_task(&self, st: &mut QueueState, key: &str, task: QueuedTask) {
        let group = st.groups.entry(key.to_string()).or_default();
        group.active = true;
        group.idle_waiting = false;
        group.is_task_run = true;
        group.running_task_id = Some(task.id.clone());
        st.active_count += 1;

        info!(group = key, task_id = %task.id, "starting task run");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            (task.job)().await;
            let mut st = queue.lock();
            queue.release(&mut st, &key);
            drop(st);
            queue.inner.run_finished.notify_waiters();
        });
    }

    fn finish_message_run(&self, key: &str, ok: bool) {
        let mut st = self.lock();
        if let Some(group) = st.groups.get_mut(key) {
            if ok {
                group.retry_count = 0;
            } else {
                self.schedule_retry(key, group);
            }
        }
        self.release(&mut st, key);
        drop(st);
        self.inner.run_finished.notify_waiters();
    }

    fn schedule_retry(&self, key: &str, group: &mut GroupState) {
        group.retry_count += 1;
        if group.retry_count > MAX_RETRIES {
            error!(
                group = key,
                retries = MAX_RETRIES,
                "max retries exceeded, waiting for the next inbound message"
            );
            group.retry_count = 0;
            return;
        }
        let delay = self.inner.retry_base * 2u32.pow(group.retry_count - 1);
        info!(group = key, attempt = group.retry_count, delay_ms = delay.as_millis() as u64, "scheduling retry");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue_message_check(&key);
        });
    }

    fn release(&self, st: &mut QueueState, key: &str) {
        if let Some(group) = st.groups.get_mut(key) {
            group.active = false;
            group.idle_waiting = false;
            group.is_task_run = false;
            group.running_task_id = None;
            group.process = None;
        }
        st.active_count = st.active_count.saturating_sub(1);
        self.drain_group(st, key);
    }

    fn drain_group(&self, st: &mut QueueState, key: &str) {
        if st.shutting_down {
            return;
        }
        if let Some(group) = st.groups.get_mut(key) {
            if let Some(task) = group.pending_tasks.pop_front() {
                self.start_task(st, key, task);
                return;
            }
            if group.pending_messages {
                self.start_messages(st, key);
                return;
            }
        }
        self.drain_waiting(st);
    }

    fn drain_waiting(&self, st: &mut QueueState) {
        while st.active_count < self.inner.max_concurrent {
            let Some(key) = st.waiting.pop_front() else {
                break;
            };
            let Some(group) = st.groups.get_mut(&key) else {
                continue;
            };
            if group.active {
                continue;
            }
            if let Some(task) = group.pending_tasks.pop_front() {
                self.start_task(st, &key, task);
            } else if group.pending_messages {
                self.start_messages(st, &key);
            }
        }
    }

    /// Stop accepting work, ask every live process to wind down, wait up to
    /// `grace` for runs to finish, then force-kill whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        let handles: Vec<ProcessHandle> = {
            let mut st = self.lock();
            st.shutting_down = true;
            st.waiting.clear();
            st.groups
                .values_mut()
                .filter_map(|g| {
                    g.pending_messages = false;
                    g.pending_tasks.clear();
                    g.process.clone()
                })
                .collect()
        };
        info!(live = handles.len(), grace_ms = grace.as_millis() as u64, "queue shutting down");
        for handle in &handles {
            handle.close_stdin();
            handle.terminate();
        }

        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);
        loop {
            let finished = self.inner.run_finished.notified();
            if self.active_count() == 0 {
                break;
            }
            tokio::select! {
                _ = finished => {}
                _ = &mut deadline => break,
            }
        }

        let survivors: Vec<ProcessHandle> = {
            let st = self.lock();
            st.groups
                .values()
                .filter(|g| g.active)
                .filter_map(|g| g.process.clone())
                .collect()
        };
        for handle in &survivors {
            warn!(process = handle.name(), "still running after grace period, killing");
            handle.kill();
        }
    }
}
