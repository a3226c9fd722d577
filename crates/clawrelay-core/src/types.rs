use std::fmt;
use std::str::FromStr;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Current time as an ISO-8601 UTC string with millisecond precision.
/// Every timestamp the store compares lexically is produced in this format.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn default_true() -> bool {
    true
}

/// A conversation the router answers in, bound to one agent identity folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredGroup {
    pub jid: String,
    pub name: String,
    /// Identity folder; unique across registrations.
    pub folder: String,
    /// Trigger word, e.g. "@Andy"
    pub trigger: String,
    #[serde(rename = "requiresTrigger", default = "default_true")]
    pub requires_trigger: bool,
    #[serde(rename = "addedAt")]
    pub added_at: String,
    #[serde(rename = "containerConfig", default, skip_serializing_if = "Option::is_none")]
    pub container_config: Option<ContainerConfig>,
}

/// Per-registration container overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "additionalMounts", default, skip_serializing_if = "Vec::is_empty")]
    pub additional_mounts: Vec<AdditionalMount>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdditionalMount {
    #[serde(rename = "hostPath")]
    pub host_path: String,
    /// Mounted at /workspace/extra/<name>; defaults to the host basename.
    #[serde(rename = "containerPath", default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
    #[serde(default = "default_true")]
    pub readonly: bool,
}

/// An inbound (or stored) chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub id: String,
    pub chat_jid: String,
    pub sender: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_bot_message: bool,
    /// Receive order assigned by the store; 0 until stored.
    #[serde(default)]
    pub seq: i64,
}

/// Chat metadata, used for the available-groups snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatInfo {
    pub jid: String,
    pub name: String,
    pub channel: String,
    pub last_message_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleType {
    Cron,
    Interval,
    Once,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// Reuse the group's agent session.
    Group,
    /// Start a fresh session for every run.
    #[default]
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(ParseError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

string_enum!(ScheduleType, "schedule type", { Cron => "cron", Interval => "interval", Once => "once" });
string_enum!(ContextMode, "context mode", { Group => "group", Isolated => "isolated" });
string_enum!(TaskStatus, "task status", { Active => "active", Paused => "paused", Completed => "completed" });
string_enum!(RunStatus, "run status", { Success => "success", Error => "error" });

/// A recurring or one-shot prompt run on behalf of a registered group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub id: String,
    pub group_folder: String,
    pub chat_jid: String,
    pub prompt: String,
    pub schedule_type: ScheduleType,
    pub schedule_value: String,
    pub context_mode: ContextMode,
    pub next_run: Option<String>,
    pub last_run: Option<String>,
    pub last_result: Option<String>,
    pub status: TaskStatus,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRunLog {
    pub task_id: String,
    pub run_at: String,
    pub duration_ms: u64,
    pub status: RunStatus,
    pub result: Option<String>,
    pub error: Option<String>,
}

/// Root settings.json structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub assistant_name: String,
    /// Folder of the privileged identity.
    pub main_group_folder: String,
    pub poll_interval_ms: u64,
    pub scheduler_poll_interval_ms: u64,
    pub ipc_poll_interval_ms: u64,
    /// Quiet period after the last relayed output before stdin is half-closed.
    pub idle_timeout_ms: u64,
    pub shutdown_grace_ms: u64,
    pub container: ContainerSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelsConfig>,
    /// Environment variable names forwarded to agents through the secrets file.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            assistant_name: "Andy".to_string(),
            main_group_folder: "main".to_string(),
            poll_interval_ms: 2_000,
            scheduler_poll_interval_ms: 60_000,
            ipc_poll_interval_ms: 1_000,
            idle_timeout_ms: 1_800_000,
            shutdown_grace_ms: 10_000,
            container: ContainerSettings::default(),
            channels: None,
            secrets: Vec::new(),
        }
    }
}

impl Settings {
    pub fn default_trigger(&self) -> String {
        format!("@{}", self.assistant_name)
    }

    pub fn telegram_token(&self) -> Option<&str> {
        self.channels
            .as_ref()
            .and_then(|c| c.telegram.as_ref())
            .and_then(|t| t.bot_token.as_deref())
            .filter(|t| !t.is_empty())
    }

    pub fn discord_token(&self) -> Option<&str> {
        self.channels
            .as_ref()
            .and_then(|c| c.discord.as_ref())
            .and_then(|d| d.bot_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerSettings {
    /// Container runtime binary (docker, podman)
    pub runtime: String,
    pub image: String,
    pub timeout_ms: u64,
    /// Cap on captured stderr per run.
    pub max_output_bytes: usize,
    pub max_concurrent: usize,
    /// Host directories under which additional mounts are permitted.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mount_allowlist: Vec<String>,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            image: "clawrelay-agent:latest".to_string(),
            timeout_ms: 1_800_000,
            max_output_bytes: 10 * 1024 * 1024,
            max_concurrent: 5,
            mount_allowlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discord: Option<DiscordChannelConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub telegram: Option<TelegramChannelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordChannelConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChannelConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_iso_is_lexically_ordered() {
        let a = now_iso();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = now_iso();
        assert!(a < b);
        assert!(a.ends_with('Z'));
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!("cron".parse::<ScheduleType>().unwrap(), ScheduleType::Cron);
        assert_eq!(TaskStatus::Paused.to_string(), "paused");
        assert!("weekly".parse::<ScheduleType>().is_err());
    }

    #[test]
    fn test_registered_group_defaults() {
        let group: RegisteredGroup = serde_json::from_str(
            r#"{"jid":"tg:1","name":"Family","folder":"family","trigger":"@Andy","addedAt":"2024-01-01T00:00:00.000Z"}"#,
        )
        .unwrap();
        assert!(group.requires_trigger);
        assert!(group.container_config.is_none());
    }

    #[test]
    fn test_settings_partial_json_keeps_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"assistant_name":"Bob","container":{"image":"x:1"}}"#).unwrap();
        assert_eq!(settings.assistant_name, "Bob");
        assert_eq!(settings.default_trigger(), "@Bob");
        assert_eq!(settings.container.image, "x:1");
        assert_eq!(settings.container.runtime, "docker");
        assert_eq!(settings.poll_interval_ms, 2_000);
    }
}
