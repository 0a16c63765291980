// Live session registry shared by listeners and shutdown.
// The lock is held only for map mutation, never across a suspend point.
use crate::session::SessionHandle;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, Arc<SessionHandle>>>,
    drained: Notify,
    next_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            drained: Notify::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn next_session_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, handle: Arc<SessionHandle>) {
        let mut sessions = self.sessions.lock();
        sessions.insert(handle.id(), handle);
        metrics::gauge!("wsgate_active_sessions").set(sessions.len() as f64);
    }

    pub fn remove(&self, id: u64) {
        let empty = {
            let mut sessions = self.sessions.lock();
            sessions.remove(&id);
            metrics::gauge!("wsgate_active_sessions").set(sessions.len() as f64);
            sessions.is_empty()
        };
        if empty {
            self.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Ask every live session to close. Handles are collected under the lock
    /// and signalled outside it.
    pub fn signal_close_all(&self) {
        let handles: Vec<_> = self.sessions.lock().values().cloned().collect();
        for handle in handles {
            handle.begin_close();
        }
    }

    /// Wait until the registry is empty, bounded by `timeout`. Returns
    /// whether the registry drained in time.
    pub async fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_empty();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::Role;
    use crate::session::SessionState;

    #[test]
    fn insert_and_remove_track_len() {
        let registry = SessionRegistry::new();
        let (first, _rx1) = SessionHandle::new(registry.next_session_id(), Role::Producer);
        let (second, _rx2) = SessionHandle::new(registry.next_session_id(), Role::Consumer);
        assert_ne!(first.id(), second.id());

        registry.insert(Arc::clone(&first));
        registry.insert(Arc::clone(&second));
        assert_eq!(registry.len(), 2);

        registry.remove(first.id());
        registry.remove(second.id());
        assert!(registry.is_empty());
    }

    #[test]
    fn signal_close_all_transitions_every_session() {
        let registry = SessionRegistry::new();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let (handle, _rx) = SessionHandle::new(registry.next_session_id(), Role::Consumer);
            handle.mark_open();
            registry.insert(Arc::clone(&handle));
            handles.push((handle, _rx));
        }

        registry.signal_close_all();
        for (handle, rx) in &handles {
            assert_eq!(handle.state(), SessionState::Closing);
            assert!(*rx.borrow());
        }
    }

    #[tokio::test]
    async fn wait_drained_resolves_when_last_session_leaves() {
        let registry = Arc::new(SessionRegistry::new());
        let (handle, _rx) = SessionHandle::new(registry.next_session_id(), Role::Producer);
        registry.insert(Arc::clone(&handle));

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_drained(Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;
        registry.remove(handle.id());
        assert!(waiter.await.expect("join"));
    }

    #[tokio::test]
    async fn wait_drained_times_out_with_sessions_left() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = SessionHandle::new(registry.next_session_id(), Role::Producer);
        registry.insert(handle);
        assert!(!registry.wait_drained(Duration::from_millis(20)).await);
    }
}
