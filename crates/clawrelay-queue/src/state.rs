use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info, warn};

use clawrelay_core::error::StoreError;
use clawrelay_core::store::Store;
use clawrelay_core::types::RegisteredGroup;

const LAST_SEQ_KEY: &str = "last_seq";
const AGENT_SEQS_KEY: &str = "last_agent_seq";

#[derive(Default)]
struct Inner {
    last_seq: i64,
    agent_cursors: HashMap<String, i64>,
    sessions: HashMap<String, String>,
    /// Registrations keyed by folder.
    groups: BTreeMap<String, RegisteredGroup>,
    /// Sequence of the newest message handed to each live message run.
    coverage: HashMap<String, i64>,
}

/// Cursors, sessions and registrations. Cursors are store receive sequences
/// (0 = nothing seen). Every mutating method writes through to the store
/// before returning.
pub struct RouterState {
    store: Store,
    inner: Mutex<Inner>,
}

impl RouterState {
    pub fn load(store: Store) -> Result<Self, StoreError> {
        let last_seq = match store.get_router_state(LAST_SEQ_KEY)? {
            None => 0,
            Some(raw) => raw.trim().parse::<i64>().unwrap_or_else(|e| {
                warn!(value = %raw, error = %e, "corrupted observe cursor, resetting");
                0
            }),
        };
        let agent_cursors = match store.get_router_state(AGENT_SEQS_KEY)? {
            None => HashMap::new(),
            Some(raw) => match serde_json::from_str::<HashMap<String, i64>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(error = %e, "corrupted agent cursors, resetting");
                    store.set_router_state(AGENT_SEQS_KEY, "{}")?;
                    HashMap::new()
                }
            },
        };
        let sessions = store.all_sessions()?;
        let groups = store
            .all_groups()?
            .into_iter()
            .map(|g| (g.folder.clone(), g))
            .collect::<BTreeMap<_, _>>();
        info!(
            groups = groups.len(),
            sessions = sessions.len(),
            last_seq,
            "router state loaded"
        );
        Ok(Self {
            store,
            inner: Mutex::new(Inner {
                last_seq,
                agent_cursors,
                sessions,
                groups,
                coverage: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    // ─── Cursors ────────────────────────────────────────────────────────────

    pub fn last_seq(&self) -> i64 {
        self.lock().last_seq
    }

    /// Move the observe cursor forward. Older sequences are ignored.
    pub fn advance_observed(&self, seq: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if seq <= inner.last_seq {
            return Ok(());
        }
        self.store.set_router_state(LAST_SEQ_KEY, &seq.to_string())?;
        inner.last_seq = seq;
        Ok(())
    }

    pub fn agent_cursor(&self, folder: &str) -> i64 {
        self.lock().agent_cursors.get(folder).copied().unwrap_or(0)
    }

    /// Advance a conversation's cursor, never past the observe cursor and
    /// never backwards. Returns whether it moved.
    pub fn advance_agent_cursor(&self, folder: &str, seq: i64) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let target = seq.min(inner.last_seq);
        let current = inner.agent_cursors.get(folder).copied().unwrap_or(0);
        if target <= current {
            return Ok(false);
        }
        let mut next = inner.agent_cursors.clone();
        next.insert(folder.to_string(), target);
        self.store
            .set_router_state(AGENT_SEQS_KEY, &serde_json::to_string(&next)?)?;
        debug!(group = folder, cursor = target, "agent cursor advanced");
        inner.agent_cursors = next;
        Ok(true)
    }

    /// Put a cursor back to the value it had before a failed attempt.
    pub fn rollback_agent_cursor(&self, folder: &str, previous: i64) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let mut next = inner.agent_cursors.clone();
        if previous == 0 {
            next.remove(folder);
        } else {
            next.insert(folder.to_string(), previous);
        }
        if next == inner.agent_cursors {
            return Ok(());
        }
        self.store
            .set_router_state(AGENT_SEQS_KEY, &serde_json::to_string(&next)?)?;
        warn!(group = folder, cursor = previous, "agent cursor rolled back");
        inner.agent_cursors = next;
        Ok(())
    }

    // ─── In-flight coverage ─────────────────────────────────────────────────

    pub fn begin_run(&self, folder: &str, coverage: i64) {
        self.lock().coverage.insert(folder.to_string(), coverage);
    }

    pub fn extend_coverage(&self, folder: &str, seq: i64) {
        let mut inner = self.lock();
        if let Some(current) = inner.coverage.get_mut(folder) {
            *current = (*current).max(seq);
        }
    }

    pub fn coverage(&self, folder: &str) -> Option<i64> {
        self.lock().coverage.get(folder).copied()
    }

    /// Returns the final coverage of the run.
    pub fn end_run(&self, folder: &str) -> Option<i64> {
        self.lock().coverage.remove(folder)
    }

    // ─── Sessions ───────────────────────────────────────────────────────────

    pub fn session(&self, folder: &str) -> Option<String> {
        self.lock().sessions.get(folder).cloned()
    }

    pub fn set_session(&self, folder: &str, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.sessions.get(folder).map(String::as_str) == Some(session_id) {
            return Ok(());
        }
        self.store.set_session(folder, session_id)?;
        inner
            .sessions
            .insert(folder.to_string(), session_id.to_string());
        Ok(())
    }

    pub fn clear_session(&self, folder: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let removed = self.store.clear_session(folder)?;
        inner.sessions.remove(folder);
        Ok(removed)
    }

    // ─── Registrations ──────────────────────────────────────────────────────

    pub fn group(&self, folder: &str) -> Option<RegisteredGroup> {
        self.lock().groups.get(folder).cloned()
    }

    pub fn groups(&self) -> Vec<RegisteredGroup> {
        self.lock().groups.values().cloned().collect()
    }

    pub fn groups_for_jid(&self, jid: &str) -> Vec<RegisteredGroup> {
        self.lock()
            .groups
            .values()
            .filter(|g| g.jid == jid)
            .cloned()
            .collect()
    }

    pub fn registered_jids(&self) -> Vec<String> {
        let mut jids: Vec<String> = self.lock().groups.values().map(|g| g.jid.clone()).collect();
        jids.sort();
        jids.dedup();
        jids
    }

    pub fn register_group(&self, group: RegisteredGroup) -> Result<(), StoreError> {
        let mut inner = self.lock();
        self.store.register_group(&group)?;
        info!(group = %group.folder, jid = %group.jid, "group registered");
        inner.groups.insert(group.folder.clone(), group);
        Ok(())
    }

    pub fn remove_group(&self, folder: &str) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let removed = self.store.remove_group(folder)?;
        inner.groups.remove(folder);
        if removed {
            info!(group = folder, "group removed");
        }
        Ok(removed)
    }

    /// Re-read registrations written by another process (e.g. the CLI).
    pub fn reload_groups(&self) -> Result<usize, StoreError> {
        let groups = self.store.all_groups()?;
        let mut inner = self.lock();
        inner.groups = groups.into_iter().map(|g| (g.folder.clone(), g)).collect();
        Ok(inner.groups.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn group(folder: &str, jid: &str) -> RegisteredGroup {
        RegisteredGroup {
            jid: jid.to_string(),
            name: folder.to_string(),
            folder: folder.to_string(),
            trigger: "@Andy".to_string(),
            requires_trigger: true,
            added_at: "2024-01-01T00:00:00.000Z".to_string(),
            container_config: None,
        }
    }

    #[test]
    fn test_cursors_survive_reload() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");
        {
            let state = RouterState::load(Store::open(&path).unwrap()).unwrap();
            state.advance_observed(5).unwrap();
            assert!(state.advance_agent_cursor("family", 3).unwrap());
            state.set_session("family", "s1").unwrap();
        }
        let state = RouterState::load(Store::open(&path).unwrap()).unwrap();
        assert_eq!(state.last_seq(), 5);
        assert_eq!(state.agent_cursor("family"), 3);
        assert_eq!(state.session("family").as_deref(), Some("s1"));
    }

    #[test]
    fn test_agent_cursor_is_monotonic_and_bounded() {
        let state = RouterState::load(Store::open_in_memory().unwrap()).unwrap();
        state.advance_observed(5).unwrap();

        assert!(state.advance_agent_cursor("g", 4).unwrap());
        assert!(!state.advance_agent_cursor("g", 2).unwrap());
        assert_eq!(state.agent_cursor("g"), 4);

        state.advance_agent_cursor("g", 9).unwrap();
        assert_eq!(state.agent_cursor("g"), 5);
    }

    #[test]
    fn test_observe_cursor_never_moves_back() {
        let state = RouterState::load(Store::open_in_memory().unwrap()).unwrap();
        state.advance_observed(5).unwrap();
        state.advance_observed(1).unwrap();
        assert_eq!(state.last_seq(), 5);
    }

    #[test]
    fn test_rollback_restores_exact_value() {
        let state = RouterState::load(Store::open_in_memory().unwrap()).unwrap();
        state.advance_observed(5).unwrap();
        state.advance_agent_cursor("g", 4).unwrap();
        state.rollback_agent_cursor("g", 0).unwrap();
        assert_eq!(state.agent_cursor("g"), 0);

        state.advance_agent_cursor("g", 2).unwrap();
        state.advance_agent_cursor("g", 5).unwrap();
        state.rollback_agent_cursor("g", 2).unwrap();
        assert_eq!(state.agent_cursor("g"), 2);
    }

    #[test]
    fn test_corrupted_cursors_are_reset() {
        let store = Store::open_in_memory().unwrap();
        store.set_router_state(AGENT_SEQS_KEY, "{not json").unwrap();
        store.set_router_state(LAST_SEQ_KEY, "2024-01-01T00:00:00Z").unwrap();
        let state = RouterState::load(store.clone()).unwrap();
        assert_eq!(state.agent_cursor("g"), 0);
        assert_eq!(state.last_seq(), 0);
        assert_eq!(
            store.get_router_state(AGENT_SEQS_KEY).unwrap().as_deref(),
            Some("{}")
        );
    }

    #[test]
    fn test_coverage_tracking() {
        let state = RouterState::load(Store::open_in_memory().unwrap()).unwrap();
        assert!(state.coverage("g").is_none());
        state.extend_coverage("g", 9);
        assert!(state.coverage("g").is_none());

        state.begin_run("g", 2);
        state.extend_coverage("g", 4);
        state.extend_coverage("g", 3);
        assert_eq!(state.end_run("g"), Some(4));
        assert!(state.coverage("g").is_none());
    }

    #[test]
    fn test_registrations_share_jid() {
        let state = RouterState::load(Store::open_in_memory().unwrap()).unwrap();
        state.register_group(group("family", "tg:1")).unwrap();
        state.register_group(group("family-helper", "tg:1")).unwrap();
        state.register_group(group("work", "dc:7")).unwrap();

        assert_eq!(state.groups_for_jid("tg:1").len(), 2);
        assert_eq!(state.registered_jids(), vec!["dc:7", "tg:1"]);

        assert!(state.remove_group("work").unwrap());
        assert!(state.group("work").is_none());
        assert_eq!(state.reload_groups().unwrap(), 2);
    }
}
