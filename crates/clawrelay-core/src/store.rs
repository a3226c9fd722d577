use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row, ToSql};

use crate::error::StoreError;
use crate::types::{
    ChatInfo, ContainerConfig, NewMessage, RegisteredGroup, ScheduledTask, TaskRunLog, TaskStatus,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS chats (
    jid TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    channel TEXT NOT NULL DEFAULT '',
    last_message_time TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS messages (
    id TEXT NOT NULL,
    chat_jid TEXT NOT NULL,
    sender TEXT NOT NULL,
    sender_name TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    is_from_me INTEGER NOT NULL DEFAULT 0,
    is_bot_message INTEGER NOT NULL DEFAULT 0,
    seq INTEGER NOT NULL,
    PRIMARY KEY (id, chat_jid)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_seq ON messages (seq);
CREATE INDEX IF NOT EXISTS idx_messages_chat_seq ON messages (chat_jid, seq);
CREATE TABLE IF NOT EXISTS registered_groups (
    folder TEXT PRIMARY KEY,
    jid TEXT NOT NULL,
    name TEXT NOT NULL,
    trigger_pattern TEXT NOT NULL,
    requires_trigger INTEGER NOT NULL DEFAULT 1,
    added_at TEXT NOT NULL,
    container_config TEXT
);
CREATE TABLE IF NOT EXISTS sessions (
    group_folder TEXT PRIMARY KEY,
    session_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS router_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id TEXT PRIMARY KEY,
    group_folder TEXT NOT NULL,
    chat_jid TEXT NOT NULL,
    prompt TEXT NOT NULL,
    schedule_type TEXT NOT NULL,
    schedule_value TEXT NOT NULL,
    context_mode TEXT NOT NULL DEFAULT 'isolated',
    next_run TEXT,
    last_run TEXT,
    last_result TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tasks_next_run ON scheduled_tasks (status, next_run);
CREATE TABLE IF NOT EXISTS task_run_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id TEXT NOT NULL,
    run_at TEXT NOT NULL,
    duration_ms INTEGER NOT NULL,
    status TEXT NOT NULL,
    result TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_task_runs ON task_run_logs (task_id, run_at);
"#;

const TASK_COLUMNS: &str = "id, group_folder, chat_jid, prompt, schedule_type, schedule_value, \
     context_mode, next_run, last_run, last_result, status, created_at";

const MESSAGE_COLUMNS: &str =
    "id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message, seq";

/// SQLite-backed persistent state. Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        // WAL + FULL sync: a committed cursor write survives a crash.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ─── Chats ──────────────────────────────────────────────────────────────

    /// Record that a chat exists. A non-empty name or channel overwrites the stored one.
    pub fn store_chat_metadata(
        &self,
        jid: &str,
        timestamp: &str,
        name: Option<&str>,
        channel: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO chats (jid, name, channel, last_message_time) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(jid) DO UPDATE SET
                name = CASE WHEN excluded.name != '' THEN excluded.name ELSE chats.name END,
                channel = CASE WHEN excluded.channel != '' THEN excluded.channel ELSE chats.channel END,
                last_message_time = MAX(chats.last_message_time, excluded.last_message_time)",
            params![jid, name.unwrap_or(""), channel.unwrap_or(""), timestamp],
        )?;
        Ok(())
    }

    pub fn all_chats(&self) -> Result<Vec<ChatInfo>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT jid, name, channel, last_message_time FROM chats ORDER BY last_message_time DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ChatInfo {
                jid: row.get(0)?,
                name: row.get(1)?,
                channel: row.get(2)?,
                last_message_time: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ─── Messages ───────────────────────────────────────────────────────────

    /// Append a message under the next receive sequence. Returns false when
    /// (id, chat) was already stored.
    /// Sequences strictly increase in receive order, whatever the platform
    /// timestamps say.
    pub fn store_message(&self, msg: &NewMessage) -> Result<bool, StoreError> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                (id, chat_jid, sender, sender_name, content, timestamp, is_from_me, is_bot_message, seq)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                     (SELECT COALESCE(MAX(seq), 0) + 1 FROM messages))",
            params![
                msg.id,
                msg.chat_jid,
                msg.sender,
                msg.sender_name,
                msg.content,
                msg.timestamp,
                msg.is_from_me,
                msg.is_bot_message
            ],
        )?;
        Ok(inserted > 0)
    }

    /// Non-bot messages in any of `jids` received after sequence `since`, in
    /// receive order.
    pub fn new_messages(&self, jids: &[String], since: i64) -> Result<Vec<NewMessage>, StoreError> {
        if jids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; jids.len()].join(", ");
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE seq > ? AND is_bot_message = 0 AND chat_jid IN ({placeholders})
             ORDER BY seq"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let mut args: Vec<&dyn ToSql> = vec![&since];
        args.extend(jids.iter().map(|jid| jid as &dyn ToSql));
        let rows = stmt.query_map(args.as_slice(), message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Non-bot messages of one chat with `since < seq <= until`, in receive order.
    pub fn messages_since(
        &self,
        jid: &str,
        since: i64,
        until: i64,
    ) -> Result<Vec<NewMessage>, StoreError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_jid = ?1 AND seq > ?2 AND seq <= ?3 AND is_bot_message = 0
             ORDER BY seq"
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![jid, since, until], message_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ─── Router state ───────────────────────────────────────────────────────

    pub fn get_router_state(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn()
            .query_row("SELECT value FROM router_state WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    pub fn set_router_state(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO router_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub fn get_session(&self, folder: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT session_id FROM sessions WHERE group_folder = ?1",
                params![folder],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_session(&self, folder: &str, session_id: &str) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO sessions (group_folder, session_id) VALUES (?1, ?2)
             ON CONFLICT(group_folder) DO UPDATE SET session_id = excluded.session_id",
            params![folder, session_id],
        )?;
        Ok(())
    }

    pub fn all_sessions(&self) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT group_folder, session_id FROM sessions")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<HashMap<_, _>, _>>()?)
    }

    pub fn clear_session(&self, folder: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("DELETE FROM sessions WHERE group_folder = ?1", params![folder])?;
        Ok(n > 0)
    }

    // ─── Registered groups ──────────────────────────────────────────────────

    /// Insert or replace the registration for `group.folder`.
    pub fn register_group(&self, group: &RegisteredGroup) -> Result<(), StoreError> {
        let container = group
            .container_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn().execute(
            "INSERT INTO registered_groups
                (folder, jid, name, trigger_pattern, requires_trigger, added_at, container_config)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(folder) DO UPDATE SET
                jid = excluded.jid,
                name = excluded.name,
                trigger_pattern = excluded.trigger_pattern,
                requires_trigger = excluded.requires_trigger,
                container_config = excluded.container_config",
            params![
                group.folder,
                group.jid,
                group.name,
                group.trigger,
                group.requires_trigger,
                group.added_at,
                container
            ],
        )?;
        Ok(())
    }

    /// Remove a registration. Message history is kept.
    pub fn remove_group(&self, folder: &str) -> Result<bool, StoreError> {
        let n = self
            .conn()
            .execute("DELETE FROM registered_groups WHERE folder = ?1", params![folder])?;
        Ok(n > 0)
    }

    pub fn get_group(&self, folder: &str) -> Result<Option<RegisteredGroup>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT folder, jid, name, trigger_pattern, requires_trigger, added_at, container_config
                 FROM registered_groups WHERE folder = ?1",
                params![folder],
                group_from_row,
            )
            .optional()?)
    }

    pub fn all_groups(&self) -> Result<Vec<RegisteredGroup>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT folder, jid, name, trigger_pattern, requires_trigger, added_at, container_config
             FROM registered_groups ORDER BY added_at, folder",
        )?;
        let rows = stmt.query_map([], group_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    // ─── Scheduled tasks ────────────────────────────────────────────────────

    pub fn create_task(&self, task: &ScheduledTask) -> Result<(), StoreError> {
        self.conn().execute(
            &format!(
                "INSERT INTO scheduled_tasks ({TASK_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                task.id,
                task.group_folder,
                task.chat_jid,
                task.prompt,
                task.schedule_type.as_str(),
                task.schedule_value,
                task.context_mode.as_str(),
                task.next_run,
                task.last_run,
                task.last_result,
                task.status.as_str(),
                task.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>, StoreError> {
        Ok(self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                params![id],
                task_from_row,
            )
            .optional()?)
    }

    pub fn all_tasks(&self) -> Result<Vec<ScheduledTask>, StoreError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY created_at"),
            &[],
        )
    }

    pub fn tasks_for_group(&self, folder: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE group_folder = ?1 ORDER BY created_at"
            ),
            &[folder],
        )
    }

    /// Active tasks whose next run is at or before `now`.
    pub fn due_tasks(&self, now: &str) -> Result<Vec<ScheduledTask>, StoreError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                 WHERE status = 'active' AND next_run IS NOT NULL AND next_run <= ?1
                 ORDER BY next_run"
            ),
            &[now],
        )
    }

    fn query_tasks(&self, sql: &str, args: &[&str]) -> Result<Vec<ScheduledTask>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), task_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn update_task_status(&self, id: &str, status: TaskStatus) -> Result<bool, StoreError> {
        let n = self.conn().execute(
            "UPDATE scheduled_tasks SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        Ok(n > 0)
    }

    pub fn set_task_next_run(&self, id: &str, next_run: Option<&str>) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE scheduled_tasks SET next_run = ?2 WHERE id = ?1",
            params![id, next_run],
        )?;
        Ok(())
    }

    /// Record the outcome of a run. A task with no next run is marked completed.
    pub fn update_task_after_run(
        &self,
        id: &str,
        run_at: &str,
        next_run: Option<&str>,
        last_result: &str,
    ) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE scheduled_tasks
             SET next_run = ?2, last_run = ?3, last_result = ?4,
                 status = CASE WHEN ?2 IS NULL THEN 'completed' ELSE status END
             WHERE id = ?1",
            params![id, next_run, run_at, last_result],
        )?;
        Ok(())
    }

    /// Delete a task and its run history.
    pub fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM task_run_logs WHERE task_id = ?1", params![id])?;
        let n = tx.execute("DELETE FROM scheduled_tasks WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(n > 0)
    }

    pub fn log_task_run(&self, log: &TaskRunLog) -> Result<(), StoreError> {
        self.conn().execute(
            "INSERT INTO task_run_logs (task_id, run_at, duration_ms, status, result, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                log.task_id,
                log.run_at,
                log.duration_ms as i64,
                log.status.as_str(),
                log.result,
                log.error
            ],
        )?;
        Ok(())
    }

    /// Most recent runs first.
    pub fn task_run_logs(&self, task_id: &str, limit: usize) -> Result<Vec<TaskRunLog>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, run_at, duration_ms, status, result, error FROM task_run_logs
             WHERE task_id = ?1 ORDER BY run_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![task_id, limit as i64], |row| {
            Ok(TaskRunLog {
                task_id: row.get(0)?,
                run_at: row.get(1)?,
                duration_ms: row.get::<_, i64>(2)?.max(0) as u64,
                status: parse_column(row, 3)?,
                result: row.get(4)?,
                error: row.get(5)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

fn parse_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<NewMessage> {
    Ok(NewMessage {
        id: row.get(0)?,
        chat_jid: row.get(1)?,
        sender: row.get(2)?,
        sender_name: row.get(3)?,
        content: row.get(4)?,
        timestamp: row.get(5)?,
        is_from_me: row.get(6)?,
        is_bot_message: row.get(7)?,
        seq: row.get(8)?,
    })
}

fn group_from_row(row: &Row<'_>) -> rusqlite::Result<RegisteredGroup> {
    let container: Option<String> = row.get(6)?;
    let container_config = container
        .map(|raw| serde_json::from_str::<ContainerConfig>(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(RegisteredGroup {
        folder: row.get(0)?,
        jid: row.get(1)?,
        name: row.get(2)?,
        trigger: row.get(3)?,
        requires_trigger: row.get(4)?,
        added_at: row.get(5)?,
        container_config,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        group_folder: row.get(1)?,
        chat_jid: row.get(2)?,
        prompt: row.get(3)?,
        schedule_type: parse_column(row, 4)?,
        schedule_value: row.get(5)?,
        context_mode: parse_column(row, 6)?,
        next_run: row.get(7)?,
        last_run: row.get(8)?,
        last_result: row.get(9)?,
        status: parse_column(row, 10)?,
        created_at: row.get(11)?,
    })
}
