//! Feeds due scheduled tasks into the group queue and records their runs.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use clawrelay_core::logging::preview;
use clawrelay_core::schedule::{compute_next_run, to_iso};
use clawrelay_core::types::{RunStatus, ScheduledTask, TaskRunLog, TaskStatus};
use clawrelay_queue::group_queue::TaskFuture;
use clawrelay_queue::{Engine, TaskOutcome};

/// Enqueue every active task whose `next_run` has passed. Returns how many
/// were handed to the queue.
pub fn enqueue_due_tasks(engine: &Engine) -> Result<usize> {
    let now = to_iso(Utc::now());
    let due = engine.store().due_tasks(&now)?;
    if due.is_empty() {
        return Ok(0);
    }
    debug!(count = due.len(), "due tasks found");

    let mut enqueued = 0;
    for task in due {
        // The task may have been paused or cancelled since the query ran.
        let Some(current) = engine.store().get_task(&task.id)? else {
            continue;
        };
        if current.status != TaskStatus::Active {
            continue;
        }
        let job_engine = engine.clone();
        let folder = current.group_folder.clone();
        let task_id = current.id.clone();
        engine.queue().enqueue_task(
            &folder,
            &task_id,
            Box::new(move || {
                Box::pin(async move {
                    execute_task(&job_engine, &current).await;
                }) as TaskFuture
            }),
        );
        enqueued += 1;
    }
    Ok(enqueued)
}

/// Run one task and do the bookkeeping: run log, next run, last result.
pub async fn execute_task(engine: &Engine, task: &ScheduledTask) -> TaskOutcome {
    let run_at = to_iso(Utc::now());
    let outcome = engine.run_task(task).await;
    if let Err(e) = record_run(engine, task, &run_at, &outcome) {
        error!(task_id = %task.id, error = %e, "failed to record task run");
    }
    outcome
}

fn record_run(
    engine: &Engine,
    task: &ScheduledTask,
    run_at: &str,
    outcome: &TaskOutcome,
) -> Result<()> {
    let store = engine.store();
    let (next_run, unschedulable) =
        match compute_next_run(task.schedule_type, &task.schedule_value, Utc::now()) {
            Ok(next) => (next, false),
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "cannot compute next run, pausing task");
                (None, true)
            }
        };
    let summary = match outcome.status {
        RunStatus::Success => outcome
            .result
            .as_deref()
            .map(|r| preview(r, 200))
            .unwrap_or_else(|| "Completed".to_string()),
        RunStatus::Error => format!(
            "Error: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        ),
    };
    store.update_task_after_run(&task.id, run_at, next_run.as_deref(), &summary)?;
    if unschedulable {
        store.update_task_status(&task.id, TaskStatus::Paused)?;
    }
    store.log_task_run(&TaskRunLog {
        task_id: task.id.clone(),
        run_at: run_at.to_string(),
        duration_ms: outcome.duration_ms,
        status: outcome.status,
        result: outcome.result.clone(),
        error: outcome.error.clone(),
    })?;

    info!(
        task_id = %task.id,
        status = %outcome.status,
        duration_ms = outcome.duration_ms,
        next_run = next_run.as_deref().unwrap_or("none"),
        "task run recorded"
    );
    Ok(())
}

/// Check for due tasks every `interval` until `shutdown` flips to true.
pub async fn run_scheduler(engine: Engine, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    info!(interval_ms = interval.as_millis() as u64, "scheduler started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match enqueue_due_tasks(&engine) {
                    Ok(0) => {}
                    Ok(n) => info!(count = n, "scheduled tasks enqueued"),
                    Err(e) => error!(error = %e, "scheduler tick failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    info!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use clawrelay_core::channel::{Channel, ChannelRegistry, InboundSender};
    use clawrelay_core::config::Paths;
    use clawrelay_core::store::Store;
    use clawrelay_core::types::{now_iso, ContextMode, RegisteredGroup, ScheduleType, Settings};
    use clawrelay_queue::group_queue::ProcessHandle;
    use clawrelay_queue::runner::{
        AgentEvent, AgentRun, AgentRunner, EventStatus, RunOutcome, RunRequest, RunnerError,
    };
    use clawrelay_queue::{EngineConfig, GroupQueue, RouterState};
    use tempfile::TempDir;
    use tokio::sync::{mpsc, oneshot};

    /// Answers every run with a single result and a completion marker.
    struct EchoRunner {
        prompts: Mutex<Vec<String>>,
    }

    impl AgentRunner for EchoRunner {
        fn start(&self, request: RunRequest) -> Result<AgentRun, RunnerError> {
            self.prompts.lock().unwrap().push(request.input.prompt.clone());
            let (handle, endpoint) = ProcessHandle::new("echo");
            let (tx, rx) = mpsc::channel(4);
            let (done_tx, done_rx) = oneshot::channel();
            let reply = format!("done: {}", request.input.prompt);
            tokio::spawn(async move {
                let _endpoint = endpoint;
                for result in [Some(reply), None] {
                    let _ = tx
                        .send(AgentEvent {
                            status: EventStatus::Ok,
                            result,
                            new_session_id: None,
                            error: None,
                        })
                        .await;
                }
                drop(tx);
                let _ = done_tx.send(RunOutcome::Success);
            });
            Ok(AgentRun {
                handle,
                events: rx,
                outcome: done_rx,
            })
        }
    }

    struct NullChannel;

    #[async_trait]
    impl Channel for NullChannel {
        fn name(&self) -> &str {
            "null"
        }
        async fn connect(&self, _inbound: InboundSender) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_message(&self, _jid: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
        fn owns_jid(&self, _jid: &str) -> bool {
            true
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn disconnect(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn engine(tmp: &TempDir) -> (Engine, Arc<EchoRunner>) {
        let state = RouterState::load(Store::open_in_memory().unwrap()).unwrap();
        state
            .register_group(RegisteredGroup {
                jid: "tg:1".to_string(),
                name: "Family".to_string(),
                folder: "family".to_string(),
                trigger: "@Andy".to_string(),
                requires_trigger: true,
                added_at: now_iso(),
                container_config: None,
            })
            .unwrap();
        let runner = Arc::new(EchoRunner {
            prompts: Mutex::new(Vec::new()),
        });
        let mut channels = ChannelRegistry::new();
        channels.add(Arc::new(NullChannel));
        let engine = Engine::new(
            state,
            GroupQueue::new(2),
            runner.clone(),
            channels,
            EngineConfig::from_settings(&Settings::default()),
            Paths::from_home(tmp.path().to_path_buf()),
        );
        (engine, runner)
    }

    fn task(id: &str, schedule_type: ScheduleType, value: &str, next_run: &str) -> ScheduledTask {
        ScheduledTask {
            id: id.to_string(),
            group_folder: "family".to_string(),
            chat_jid: "tg:1".to_string(),
            prompt: format!("prompt {}", id),
            schedule_type,
            schedule_value: value.to_string(),
            context_mode: ContextMode::Isolated,
            next_run: Some(next_run.to_string()),
            last_run: None,
            last_result: None,
            status: TaskStatus::Active,
            created_at: now_iso(),
        }
    }

    async fn wait_for_logs(engine: &Engine, id: &str) -> Vec<TaskRunLog> {
        for _ in 0..200 {
            let logs = engine.store().task_run_logs(id, 10).unwrap();
            if !logs.is_empty() {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("task {} never ran", id);
    }

    #[tokio::test]
    async fn test_once_task_completes() {
        let tmp = TempDir::new().unwrap();
        let (engine, runner) = engine(&tmp);
        engine
            .store()
            .create_task(&task("t1", ScheduleType::Once, "2020-01-01T00:00:00Z", "2020-01-01T00:00:00.000Z"))
            .unwrap();

        assert_eq!(enqueue_due_tasks(&engine).unwrap(), 1);
        let logs = wait_for_logs(&engine, "t1").await;
        assert_eq!(logs[0].status, RunStatus::Success);
        assert_eq!(*runner.prompts.lock().unwrap(), vec!["prompt t1".to_string()]);

        let stored = engine.store().get_task("t1").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.next_run.is_none());
        assert_eq!(stored.last_result.as_deref(), Some("done: prompt t1"));
    }

    #[tokio::test]
    async fn test_interval_task_is_rescheduled() {
        let tmp = TempDir::new().unwrap();
        let (engine, _runner) = engine(&tmp);
        engine
            .store()
            .create_task(&task("t2", ScheduleType::Interval, "3600000", "2020-01-01T00:00:00.000Z"))
            .unwrap();

        enqueue_due_tasks(&engine).unwrap();
        wait_for_logs(&engine, "t2").await;

        let stored = engine.store().get_task("t2").unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Active);
        let next = stored.next_run.unwrap();
        assert!(next > to_iso(Utc::now()));
    }

    #[tokio::test]
    async fn test_paused_and_future_tasks_are_skipped() {
        let tmp = TempDir::new().unwrap();
        let (engine, runner) = engine(&tmp);
        let mut paused = task("t3", ScheduleType::Interval, "60000", "2020-01-01T00:00:00.000Z");
        paused.status = TaskStatus::Paused;
        engine.store().create_task(&paused).unwrap();
        engine
            .store()
            .create_task(&task("t4", ScheduleType::Interval, "60000", "2999-01-01T00:00:00.000Z"))
            .unwrap();

        assert_eq!(enqueue_due_tasks(&engine).unwrap(), 0);
        assert!(runner.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_group_logs_error_run() {
        let tmp = TempDir::new().unwrap();
        let (engine, runner) = engine(&tmp);
        let mut orphan = task("t5", ScheduleType::Once, "2020-01-01T00:00:00Z", "2020-01-01T00:00:00.000Z");
        orphan.group_folder = "ghost".to_string();

        let outcome = execute_task(&engine, &orphan).await;
        assert_eq!(outcome.status, RunStatus::Error);
        assert!(runner.prompts.lock().unwrap().is_empty());
        // Never persisted, so only the run log is written.
        let logs = engine.store().task_run_logs("t5", 10).unwrap();
        assert_eq!(logs[0].status, RunStatus::Error);
    }
}
