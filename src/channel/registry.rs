use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

use super::ChannelSink;

/// Approval waiters for one session, keyed by `tool_call_id` and kept in
/// arrival order so `/approve` and `/deny` can resolve the oldest one.
/// Each id resolves at most once; late or unmatched responses are dropped.
#[derive(Default)]
pub struct PendingApprovals {
    inner: Mutex<Vec<(String, oneshot::Sender<bool>)>>,
}

impl PendingApprovals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tool_call_id: &str) -> oneshot::Receiver<bool> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .expect("pending approvals lock poisoned")
            .push((tool_call_id.to_string(), tx));
        rx
    }

    /// Resolve a waiter by id. Returns false if no such waiter exists
    /// (already resolved, timed out, or never issued).
    pub fn resolve(&self, tool_call_id: &str, approved: bool) -> bool {
        let mut inner = self.inner.lock().expect("pending approvals lock poisoned");
        if let Some(pos) = inner.iter().position(|(id, _)| id == tool_call_id) {
            let (_, tx) = inner.remove(pos);
            let _ = tx.send(approved);
            true
        } else {
            debug!("discarding unmatched approval response for {}", tool_call_id);
            false
        }
    }

    /// Resolve the oldest pending waiter. Returns its id if one existed.
    pub fn resolve_oldest(&self, approved: bool) -> Option<String> {
        let mut inner = self.inner.lock().expect("pending approvals lock poisoned");
        if inner.is_empty() {
            return None;
        }
        let (id, tx) = inner.remove(0);
        let _ = tx.send(approved);
        Some(id)
    }

    /// Drop a waiter without answering (timeout path).
    pub fn remove(&self, tool_call_id: &str) {
        let mut inner = self.inner.lock().expect("pending approvals lock poisoned");
        inner.retain(|(id, _)| id != tool_call_id);
    }

    /// Drop every waiter; their receivers observe a closed channel, which
    /// the approval gate maps to `cancelled`.
    pub fn cancel_all(&self) {
        self.inner
            .lock()
            .expect("pending approvals lock poisoned")
            .clear();
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.inner
            .lock()
            .expect("pending approvals lock poisoned")
            .is_empty()
    }
}

/// One live connection bound to a session.
#[derive(Clone)]
pub struct ChannelEntry {
    pub sink: Arc<dyn ChannelSink>,
    pub pending: Arc<PendingApprovals>,
}

/// Connection table: session id -> live channel. The channel layer owns the
/// socket, the session manager owns the session; this map is the
/// back-reference between them, so neither owns the other.
#[derive(Default)]
pub struct ConnectionRegistry {
    entries: Mutex<HashMap<String, ChannelEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a sink to a session. A previous connection for the same session
    /// is replaced; its pending approvals are cancelled.
    pub fn register(&self, session_id: &str, sink: Arc<dyn ChannelSink>) -> ChannelEntry {
        let entry = ChannelEntry {
            sink,
            pending: Arc::new(PendingApprovals::new()),
        };
        let previous = self
            .entries
            .lock()
            .expect("registry lock poisoned")
            .insert(session_id.to_string(), entry.clone());
        if let Some(prev) = previous {
            prev.pending.cancel_all();
        }
        entry
    }

    /// Remove the binding, cancelling any waiters. No-op if another
    /// connection has already replaced this one.
    pub fn deregister(&self, session_id: &str, entry: &ChannelEntry) {
        let mut entries = self.entries.lock().expect("registry lock poisoned");
        if let Some(current) = entries.get(session_id) {
            if Arc::ptr_eq(&current.pending, &entry.pending) {
                entries.remove(session_id);
            }
        }
        entry.pending.cancel_all();
    }

    pub fn get(&self, session_id: &str) -> Option<ChannelEntry> {
        self.entries
            .lock()
            .expect("registry lock poisoned")
            .get(session_id)
            .cloned()
    }

    /// Drop the binding for a session that no longer exists.
    pub fn remove(&self, session_id: &str) {
        if let Some(entry) = self
            .entries
            .lock()
            .expect("registry lock poisoned")
            .remove(session_id)
        {
            entry.pending.cancel_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingSink;

    #[test]
    fn test_resolve_by_id_once() {
        let pending = PendingApprovals::new();
        let mut rx = pending.register("t1");
        assert!(pending.resolve("t1", true));
        assert_eq!(rx.try_recv().unwrap(), true);
        // Second resolution of the same id is a no-op.
        assert!(!pending.resolve("t1", false));
    }

    #[test]
    fn test_resolve_oldest_in_order() {
        let pending = PendingApprovals::new();
        let mut rx1 = pending.register("t1");
        let mut rx2 = pending.register("t2");
        assert_eq!(pending.resolve_oldest(false).as_deref(), Some("t1"));
        assert_eq!(rx1.try_recv().unwrap(), false);
        assert!(rx2.try_recv().is_err());
        assert_eq!(pending.resolve_oldest(true).as_deref(), Some("t2"));
        assert!(pending.resolve_oldest(true).is_none());
    }

    #[test]
    fn test_cancel_all_closes_receivers() {
        let pending = PendingApprovals::new();
        let mut rx = pending.register("t1");
        pending.cancel_all();
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
    }

    #[test]
    fn test_registry_replacement_cancels_previous() {
        let registry = ConnectionRegistry::new();
        let first = registry.register("s1", Arc::new(RecordingSink::new()));
        let mut rx = first.pending.register("t1");

        let second = registry.register("s1", Arc::new(RecordingSink::new()));
        assert!(matches!(
            rx.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));

        // Deregistering the stale entry must not unbind the live one.
        registry.deregister("s1", &first);
        assert!(registry.get("s1").is_some());
        registry.deregister("s1", &second);
        assert!(registry.get("s1").is_none());
    }
}
