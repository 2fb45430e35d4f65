use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::store::{SessionInfo, SessionStore};
use super::{HistoryEntry, SessionState};

/// Owns the `session_id -> Session` map, the per-session exclusive lock, and
/// the session lifecycle. One lock per session serialises agent turns; work
/// across sessions is fully parallel.
pub struct SessionManager {
    store: Arc<SessionStore>,
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

struct SessionSlot {
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
}

/// A scoped, exclusive acquisition of one session. Holding a `SessionTurn`
/// is holding the session lock; dropping it releases the lock on every exit
/// path. All mutation and persistence for the session goes through here.
pub struct SessionTurn {
    pub session_id: String,
    pub state: OwnedMutexGuard<SessionState>,
    pub cancel: CancellationToken,
    store: Arc<SessionStore>,
}

impl SessionTurn {
    /// Append-only history write, fsynced before returning. Callers append
    /// before any state change the entry motivated.
    pub fn append_history(&self, entry: &HistoryEntry) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("session {} is gone", self.session_id);
        }
        self.store.append_history(&self.session_id, entry)
    }

    /// Rewrite the state document (write-temp-then-rename). Refused once
    /// the session is cancelled so a deleted session cannot be resurrected
    /// by an in-flight turn.
    pub fn persist(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            bail!("session {} is gone", self.session_id);
        }
        self.store.write_state(&self.state)
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.store.read_history(&self.session_id)
    }
}

impl SessionManager {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Allocate a fresh session: new id, on-disk directory, empty state and
    /// history.
    pub async fn create(
        &self,
        channel_type: &str,
        channel_ref: Option<String>,
    ) -> Result<SessionState> {
        let id = Uuid::new_v4().to_string();
        let state = SessionState::new(id.clone(), channel_type.to_string(), channel_ref);
        self.store.create(&state)?;

        let mut slots = self.slots.lock().await;
        slots.insert(
            id.clone(),
            Arc::new(SessionSlot {
                state: Arc::new(Mutex::new(state.clone())),
                cancel: CancellationToken::new(),
            }),
        );
        info!("Created session {} ({})", id, state.channel_type);
        Ok(state)
    }

    /// Acquire the session's exclusive lock, loading state from disk on
    /// first reference. Blocks until any in-flight turn finishes.
    pub async fn open(&self, session_id: &str) -> Result<SessionTurn> {
        let slot = self.slot(session_id).await?;
        let guard = slot.state.clone().lock_owned().await;
        if slot.cancel.is_cancelled() {
            bail!("session {} is gone", session_id);
        }
        if guard.retired {
            bail!("session {} is retired", session_id);
        }
        Ok(SessionTurn {
            session_id: session_id.to_string(),
            state: guard,
            cancel: slot.cancel.clone(),
            store: self.store.clone(),
        })
    }

    /// Like `open`, but gives up after `wait`. Used by slash commands so a
    /// turn parked on an approval cannot freeze the command channel.
    pub async fn try_open(&self, session_id: &str, wait: Duration) -> Result<SessionTurn> {
        match tokio::time::timeout(wait, self.open(session_id)).await {
            Ok(turn) => turn,
            Err(_) => bail!("session {} is busy with an in-flight turn", session_id),
        }
    }

    /// Lock-free metadata listing straight from disk.
    pub fn list(&self) -> Result<Vec<SessionInfo>> {
        self.store.list()
    }

    pub fn exists(&self, session_id: &str) -> bool {
        self.store.exists(session_id)
    }

    /// Remove the session from disk. In-flight work observes cancellation
    /// at its next suspension point.
    pub async fn delete(&self, session_id: &str) -> Result<bool> {
        let slot = {
            let mut slots = self.slots.lock().await;
            slots.remove(session_id)
        };
        if let Some(slot) = slot {
            slot.cancel.cancel();
        }
        self.store.delete(session_id)
    }

    /// Retire `session_id` and allocate a successor bound to the same
    /// channel. The old session is kept on disk for audit; the new one
    /// starts with no activations, approvals, or disables.
    pub async fn reset(&self, session_id: &str) -> Result<SessionState> {
        // Cancel first so a turn parked on an approval unwinds and releases
        // the lock; the retired session accepts no further turns anyway.
        if let Some(slot) = self.slots.lock().await.get(session_id).cloned() {
            slot.cancel.cancel();
        }

        let old = self.slot(session_id).await?;
        let mut old_state = old.state.clone().lock_owned().await;
        if old_state.retired {
            bail!("session {} is already retired", session_id);
        }

        let new_state = self
            .create(&old_state.channel_type.clone(), old_state.channel_ref.clone())
            .await?;

        old_state.retired = true;
        old_state.successor = Some(new_state.session_id.clone());
        old_state.touch();
        self.store.write_state(&old_state)?;
        drop(old_state);

        // The retired slot stays cancelled and unreachable for new turns.
        self.slots.lock().await.remove(session_id);

        info!("Reset session {} -> {}", session_id, new_state.session_id);
        Ok(new_state)
    }

    /// Update `last_active` without running a turn.
    pub async fn touch(&self, session_id: &str) -> Result<()> {
        let mut turn = self.open(session_id).await?;
        turn.state.touch();
        turn.persist()
    }

    /// Delete sessions idle for more than `max_idle_days`. Called at
    /// startup, before any slot exists.
    pub fn sweep_idle(&self, max_idle_days: u64) -> Result<usize> {
        if max_idle_days == 0 {
            return Ok(0);
        }
        let cutoff = chrono::Utc::now() - chrono::Duration::days(max_idle_days as i64);
        let mut removed = 0;
        for info in self.store.list()? {
            if info.last_active < cutoff {
                match self.store.delete(&info.session_id) {
                    Ok(true) => {
                        info!("Swept idle session {}", info.session_id);
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Failed to sweep session {}: {}", info.session_id, e),
                }
            }
        }
        Ok(removed)
    }

    async fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.get(session_id) {
            return Ok(slot.clone());
        }
        let state = self
            .store
            .read_state(session_id)
            .with_context(|| format!("session not found: {}", session_id))?;
        let slot = Arc::new(SessionSlot {
            state: Arc::new(Mutex::new(state)),
            cancel: CancellationToken::new(),
        });
        slots.insert(session_id.to_string(), slot.clone());
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_manager() -> (SessionManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        (SessionManager::new(store), dir)
    }

    #[tokio::test]
    async fn test_create_open_roundtrip() {
        let (manager, _dir) = temp_manager();
        let created = manager.create("web", None).await.unwrap();
        let turn = manager.open(&created.session_id).await.unwrap();
        assert_eq!(turn.state.session_id, created.session_id);
        assert_eq!(turn.state.channel_type, "web");
    }

    #[tokio::test]
    async fn test_lock_serialises_turns() {
        let (manager, _dir) = temp_manager();
        let created = manager.create("web", None).await.unwrap();
        let turn = manager.open(&created.session_id).await.unwrap();
        // Second open must not succeed while the first turn is held.
        let second = manager
            .try_open(&created.session_id, Duration::from_millis(50))
            .await;
        assert!(second.is_err());
        drop(turn);
        assert!(manager
            .try_open(&created.session_id, Duration::from_millis(50))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_open_loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SessionStore::new(dir.path().join("sessions")));
        let id = {
            let manager = SessionManager::new(store.clone());
            let created = manager.create("cli", None).await.unwrap();
            let mut turn = manager.open(&created.session_id).await.unwrap();
            turn.state.activate_rule("r1");
            turn.persist().unwrap();
            created.session_id
        };
        // Fresh manager, same disk: state must come back.
        let manager = SessionManager::new(store);
        let turn = manager.open(&id).await.unwrap();
        assert!(turn.state.activated_rules.contains("r1"));
    }

    #[tokio::test]
    async fn test_delete_cancels_inflight() {
        let (manager, _dir) = temp_manager();
        let created = manager.create("web", None).await.unwrap();
        let turn = manager.open(&created.session_id).await.unwrap();
        let cancel = turn.cancel.clone();
        assert!(!cancel.is_cancelled());
        manager.delete(&created.session_id).await.unwrap();
        assert!(cancel.is_cancelled());
        assert!(!manager.exists(&created.session_id));
    }

    #[tokio::test]
    async fn test_reset_creates_successor_and_retires_old() {
        let (manager, _dir) = temp_manager();
        let created = manager.create("web", Some("conn-1".into())).await.unwrap();
        {
            let mut turn = manager.open(&created.session_id).await.unwrap();
            turn.state.activate_rule("r1");
            turn.state.approved_operations.insert("sig".into());
            turn.persist().unwrap();
        }

        let new_state = manager.reset(&created.session_id).await.unwrap();
        assert_ne!(new_state.session_id, created.session_id);
        assert_eq!(new_state.channel_ref.as_deref(), Some("conn-1"));
        assert!(new_state.activated_rules.is_empty());
        assert!(new_state.approved_operations.is_empty());

        let old = manager.store().read_state(&created.session_id).unwrap();
        assert!(old.retired);
        assert_eq!(old.successor.as_deref(), Some(new_state.session_id.as_str()));
        // Old session rejects further turns.
        assert!(manager.open(&created.session_id).await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_idle() {
        let (manager, _dir) = temp_manager();
        let old = manager.create("web", None).await.unwrap();
        {
            let mut turn = manager.open(&old.session_id).await.unwrap();
            turn.state.last_active = chrono::Utc::now() - chrono::Duration::days(90);
            turn.persist().unwrap();
        }
        let fresh = manager.create("web", None).await.unwrap();

        let removed = manager.sweep_idle(30).unwrap();
        assert_eq!(removed, 1);
        assert!(!manager.exists(&old.session_id));
        assert!(manager.exists(&fresh.session_id));

        // 0 disables the sweep.
        assert_eq!(manager.sweep_idle(0).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_missing_session_errors() {
        let (manager, _dir) = temp_manager();
        assert!(manager.open("nope").await.is_err());
    }
}
