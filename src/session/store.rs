use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::warn;

use super::{HistoryEntry, SessionState};

/// Flat-file session store.
///
/// Directory layout:
/// ```text
/// <data root>/sessions/
///   <session_id>/
///     state      # SessionState as YAML, rewritten atomically
///     history    # one HistoryEntry per line, append-only, fsynced
/// ```
///
/// History is flushed before any dependent state rewrite, so a crash
/// between the two leaves the appended entry on disk and the state as it
/// was before the interrupted operation.
pub struct SessionStore {
    sessions_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub channel_type: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub retired: bool,
}

impl SessionStore {
    pub fn new(sessions_dir: PathBuf) -> Self {
        Self { sessions_dir }
    }

    // ------------------------------------------------------------------
    // State document
    // ------------------------------------------------------------------

    pub fn create(&self, state: &SessionState) -> Result<()> {
        Self::validate_id(&state.session_id)?;
        let dir = self.session_dir(&state.session_id);
        fs::create_dir_all(&dir)?;
        let history = dir.join("history");
        if !history.exists() {
            fs::write(&history, "")?;
        }
        self.write_state(state)
    }

    /// Atomic rewrite: write to a temp file in the same directory, fsync,
    /// rename over the old document.
    pub fn write_state(&self, state: &SessionState) -> Result<()> {
        Self::validate_id(&state.session_id)?;
        let dir = self.session_dir(&state.session_id);
        fs::create_dir_all(&dir)?;
        let yaml = serde_yml::to_string(state)?;
        let tmp = dir.join("state.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(yaml.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join("state"))?;
        Ok(())
    }

    pub fn read_state(&self, session_id: &str) -> Result<SessionState> {
        Self::validate_id(session_id)?;
        let path = self.session_dir(session_id).join("state");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("session not found: {}", session_id))?;
        let state: SessionState = serde_yml::from_str(&content)
            .with_context(|| format!("corrupt state document for session {}", session_id))?;
        Ok(state)
    }

    pub fn exists(&self, session_id: &str) -> bool {
        Self::validate_id(session_id).is_ok()
            && self.session_dir(session_id).join("state").exists()
    }

    // ------------------------------------------------------------------
    // History log
    // ------------------------------------------------------------------

    /// Append one entry and fsync before returning. Callers rely on the
    /// entry being durable before they rewrite the state document.
    pub fn append_history(&self, session_id: &str, entry: &HistoryEntry) -> Result<()> {
        Self::validate_id(session_id)?;
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)?;
        let line = serde_json::to_string(entry)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("history"))?;
        writeln!(file, "{}", line)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn read_history(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        Self::validate_id(session_id)?;
        let path = self.session_dir(session_id).join("history");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&path)?;
        let mut entries = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    warn!("Skipping corrupt history line in session {}: {}", session_id, e);
                }
            }
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Listing and deletion
    // ------------------------------------------------------------------

    /// Metadata for every session on disk. Lock-free by design: reads the
    /// state documents directly and skips anything corrupt or mid-rewrite.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.sessions_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let state_path = entry.path().join("state");
            if !state_path.exists() {
                continue;
            }
            let content = match fs::read_to_string(&state_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!("Skipping unreadable state at {}: {}", state_path.display(), e);
                    continue;
                }
            };
            match serde_yml::from_str::<SessionState>(&content) {
                Ok(state) => sessions.push(SessionInfo {
                    session_id: state.session_id,
                    channel_type: state.channel_type,
                    created_at: state.created_at,
                    last_active: state.last_active,
                    retired: state.retired,
                }),
                Err(e) => {
                    warn!("Skipping corrupt state at {}: {}", state_path.display(), e);
                }
            }
        }
        sessions.sort_by(|a, b| b.last_active.cmp(&a.last_active));
        Ok(sessions)
    }

    /// Returns true if the session existed.
    pub fn delete(&self, session_id: &str) -> Result<bool> {
        Self::validate_id(session_id)?;
        let dir = self.session_dir(session_id);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(dir)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir.join(session_id)
    }

    fn validate_id(id: &str) -> Result<()> {
        if id.is_empty() {
            bail!("Session ID must not be empty");
        }
        if id.contains("..") || id.contains('/') || id.contains('\\') {
            bail!("Session ID contains invalid characters: {}", id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (SessionStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions"));
        (store, dir)
    }

    #[test]
    fn test_state_roundtrip() {
        let (store, _dir) = temp_store();
        let mut state = SessionState::new("s1".into(), "web".into(), None);
        state.activate_rule("no-write-after-web");
        state.disabled_rules.insert("skill-modification".into());
        state.approved_operations.insert("abc123".into());
        state.approved_credentials.insert("github".into());
        store.create(&state).unwrap();

        let loaded = store.read_state("s1").unwrap();
        assert_eq!(loaded.session_id, "s1");
        assert_eq!(loaded.activated_rules, state.activated_rules);
        assert_eq!(loaded.disabled_rules, state.disabled_rules);
        assert_eq!(loaded.approved_operations, state.approved_operations);
        assert_eq!(loaded.approved_credentials, state.approved_credentials);
    }

    #[test]
    fn test_history_order_preserved() {
        let (store, _dir) = temp_store();
        let state = SessionState::new("s1".into(), "web".into(), None);
        store.create(&state).unwrap();

        for i in 0..5 {
            store
                .append_history(
                    "s1",
                    &HistoryEntry::UserMessage {
                        content: format!("msg-{}", i),
                        ts: Utc::now(),
                    },
                )
                .unwrap();
        }
        let history = store.read_history("s1").unwrap();
        assert_eq!(history.len(), 5);
        for (i, entry) in history.iter().enumerate() {
            match entry {
                HistoryEntry::UserMessage { content, .. } => {
                    assert_eq!(content, &format!("msg-{}", i));
                }
                other => panic!("unexpected entry {:?}", other),
            }
        }
    }

    #[test]
    fn test_corrupt_history_line_skipped() {
        let (store, dir) = temp_store();
        let state = SessionState::new("s1".into(), "web".into(), None);
        store.create(&state).unwrap();
        store
            .append_history("s1", &HistoryEntry::UserMessage { content: "ok".into(), ts: Utc::now() })
            .unwrap();
        // Simulate a torn write.
        let path = dir.path().join("sessions/s1/history");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();
        store
            .append_history("s1", &HistoryEntry::UserMessage { content: "after".into(), ts: Utc::now() })
            .unwrap();

        let history = store.read_history("s1").unwrap();
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn test_crash_between_append_and_rewrite() {
        // History gains the entry; the state document still reflects the
        // pre-operation state after reload.
        let (store, _dir) = temp_store();
        let mut state = SessionState::new("s1".into(), "web".into(), None);
        store.create(&state).unwrap();

        store
            .append_history(
                "s1",
                &HistoryEntry::ToolCall {
                    tool: "write_file".into(),
                    args: serde_json::json!({"path": "/a"}),
                    tool_call_id: "t1".into(),
                    ts: Utc::now(),
                },
            )
            .unwrap();
        // Crash here: the in-memory activation below is never persisted.
        state.activate_rule("some-rule");

        let reloaded = store.read_state("s1").unwrap();
        assert!(reloaded.activated_rules.is_empty());
        assert_eq!(store.read_history("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_list_skips_corrupt_state() {
        let (store, dir) = temp_store();
        store
            .create(&SessionState::new("good".into(), "web".into(), None))
            .unwrap();
        let bad_dir = dir.path().join("sessions/bad");
        std::fs::create_dir_all(&bad_dir).unwrap();
        std::fs::write(bad_dir.join("state"), "{{{{not yaml").unwrap();

        let infos = store.list().unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].session_id, "good");
    }

    #[test]
    fn test_delete() {
        let (store, _dir) = temp_store();
        store
            .create(&SessionState::new("s1".into(), "web".into(), None))
            .unwrap();
        assert!(store.exists("s1"));
        assert!(store.delete("s1").unwrap());
        assert!(!store.exists("s1"));
        assert!(!store.delete("s1").unwrap());
    }

    #[test]
    fn test_invalid_id_rejected() {
        let (store, _dir) = temp_store();
        assert!(store.read_state("../escape").is_err());
        assert!(store
            .create(&SessionState::new("a/b".into(), "web".into(), None))
            .is_err());
        assert!(store.read_state("").is_err());
    }
}
