//! Requests agents drop into their mailbox, and who may make them.

use serde::Deserialize;
use thiserror::Error;

use clawrelay_core::error::{ScheduleError, StoreError};
use clawrelay_core::types::{ContextMode, RegisteredGroup, ScheduleType};
use clawrelay_queue::Engine;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("failed to read request: {0}")]
    Io(#[from] std::io::Error),
    #[error("'{folder}' is not allowed to {action}")]
    Unauthorized { folder: String, action: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("delivery failed: {0}")]
    Delivery(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IpcRequest {
    Message {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        text: String,
    },
    Reaction {
        #[serde(rename = "chatJid")]
        chat_jid: String,
        #[serde(rename = "messageId")]
        message_id: String,
        emoji: String,
    },
    ScheduleTask {
        prompt: String,
        schedule_type: ScheduleType,
        schedule_value: String,
        #[serde(default)]
        context_mode: ContextMode,
        #[serde(rename = "targetJid", default)]
        target_jid: Option<String>,
    },
    PauseTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    ResumeTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    CancelTask {
        #[serde(rename = "taskId")]
        task_id: String,
    },
    RegisterGroup {
        jid: String,
        name: String,
        folder: String,
        #[serde(default)]
        trigger: Option<String>,
        #[serde(rename = "requiresTrigger", default)]
        requires_trigger: Option<bool>,
    },
    RefreshGroups,
}

impl IpcRequest {
    pub fn parse(raw: &str) -> Result<Self, IpcError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            IpcRequest::Message { .. } => "message",
            IpcRequest::Reaction { .. } => "reaction",
            IpcRequest::ScheduleTask { .. } => "schedule_task",
            IpcRequest::PauseTask { .. } => "pause_task",
            IpcRequest::ResumeTask { .. } => "resume_task",
            IpcRequest::CancelTask { .. } => "cancel_task",
            IpcRequest::RegisterGroup { .. } => "register_group",
            IpcRequest::RefreshGroups => "refresh_groups",
        }
    }
}

/// Identity of a mailbox. Taken from the directory name, never from file contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub folder: String,
    pub is_main: bool,
}

impl Requester {
    pub fn new(folder: &str, main_folder: &str) -> Self {
        Self {
            folder: folder.to_string(),
            is_main: folder == main_folder,
        }
    }

    fn denied(&self, action: impl Into<String>) -> IpcError {
        IpcError::Unauthorized {
            folder: self.folder.clone(),
            action: action.into(),
        }
    }
}

fn owns_chat(engine: &Engine, requester: &Requester, jid: &str) -> bool {
    engine
        .state()
        .groups_for_jid(jid)
        .iter()
        .any(|g| g.folder == requester.folder)
}

/// The registration a new task runs under.
pub fn task_target(
    engine: &Engine,
    requester: &Requester,
    target_jid: Option<&str>,
) -> Result<RegisteredGroup, IpcError> {
    let state = engine.state();
    let Some(jid) = target_jid else {
        return state
            .group(&requester.folder)
            .ok_or_else(|| IpcError::NotFound(format!("group {}", requester.folder)));
    };
    let candidates = state.groups_for_jid(jid);
    if let Some(own) = candidates.iter().find(|g| g.folder == requester.folder) {
        return Ok(own.clone());
    }
    if !requester.is_main {
        return Err(requester.denied(format!("schedule tasks for {}", jid)));
    }
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| IpcError::NotFound(format!("registration for {}", jid)))
}

/// Check a request against the requester's privileges.
pub fn authorize(engine: &Engine, requester: &Requester, request: &IpcRequest) -> Result<(), IpcError> {
    if requester.is_main {
        return Ok(());
    }
    match request {
        IpcRequest::Message { chat_jid, .. } | IpcRequest::Reaction { chat_jid, .. } => {
            if owns_chat(engine, requester, chat_jid) {
                Ok(())
            } else {
                Err(requester.denied(format!("{} in {}", request.kind(), chat_jid)))
            }
        }
        IpcRequest::ScheduleTask { target_jid, .. } => {
            task_target(engine, requester, target_jid.as_deref()).map(|_| ())
        }
        IpcRequest::PauseTask { task_id }
        | IpcRequest::ResumeTask { task_id }
        | IpcRequest::CancelTask { task_id } => {
            let task = engine
                .store()
                .get_task(task_id)?
                .ok_or_else(|| IpcError::NotFound(format!("task {}", task_id)))?;
            if task.group_folder == requester.folder {
                Ok(())
            } else {
                Err(requester.denied(format!("{} {}", request.kind(), task_id)))
            }
        }
        IpcRequest::RegisterGroup { .. } | IpcRequest::RefreshGroups => {
            Err(requester.denied(request.kind()))
        }
    }
}
