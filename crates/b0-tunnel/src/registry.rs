//! Process-wide tunnel registry
//!
//! Maps socket ids to live tunnel handles. At most one live tunnel exists
//! per socket id; entries are removed explicitly on disconnect or session
//! teardown, never evicted implicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Handle to a live tunnel session.
#[derive(Clone, Default)]
pub struct TunnelHandle {
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
}

impl TunnelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a handle whose cancellation follows a parent token.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            cancel: parent.child_token(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token the session selects on; cancelled on disconnect or shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request the session to terminate.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Record that the session has fully terminated.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn same_session(&self, other: &TunnelHandle) -> bool {
        Arc::ptr_eq(&self.closed, &other.closed)
    }
}

/// Thread-safe socket-id → tunnel-handle map.
#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelHandle>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, socket_id: &str, handle: TunnelHandle) {
        self.tunnels.insert(socket_id.to_string(), handle);
    }

    pub fn get(&self, socket_id: &str) -> Option<TunnelHandle> {
        self.tunnels.get(socket_id).map(|entry| entry.clone())
    }

    pub fn remove(&self, socket_id: &str) {
        self.tunnels.remove(socket_id);
    }

    /// Remove the entry only if it still belongs to `handle`. A session that
    /// lost its slot to a newer tunnel must not evict the replacement.
    pub fn remove_session(&self, socket_id: &str, handle: &TunnelHandle) {
        self.tunnels
            .remove_if(socket_id, |_, current| current.same_session(handle));
    }

    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Liveness check: false when the socket has no entry or its session has
    /// terminated.
    pub fn is_connected(&self, socket_id: &str) -> bool {
        self.tunnels
            .get(socket_id)
            .map(|entry| !entry.is_closed())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_tracks_closed_flag() {
        let registry = TunnelRegistry::new();
        assert!(!registry.is_connected("s1"));

        let handle = TunnelHandle::new();
        registry.add("s1", handle.clone());
        assert!(registry.is_connected("s1"));
        assert_eq!(registry.len(), 1);

        handle.mark_closed();
        assert!(!registry.is_connected("s1"));

        registry.remove("s1");
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_session_cannot_evict_replacement() {
        let registry = TunnelRegistry::new();

        let old = TunnelHandle::new();
        registry.add("s1", old.clone());

        let new = TunnelHandle::new();
        registry.add("s1", new.clone());

        old.mark_closed();
        registry.remove_session("s1", &old);
        assert!(registry.is_connected("s1"));

        registry.remove_session("s1", &new);
        assert!(!registry.is_connected("s1"));
    }

    #[test]
    fn close_cancels_session_token() {
        let handle = TunnelHandle::new();
        assert!(!handle.cancellation().is_cancelled());
        handle.close();
        assert!(handle.cancellation().is_cancelled());
    }
}
