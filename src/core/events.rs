use crate::core::session::SessionState;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    SessionUpdated(SessionState),
    Info { scope: String, message: String },
    Error { scope: String, message: String },
}

pub type ListenerId = Uuid;

/// Receives every session state transition, always on the engine's callback context.
pub trait SessionStateListener: Send + Sync {
    fn on_state_update(&self, state: &SessionState);
}

impl<F> SessionStateListener for F
where
    F: Fn(&SessionState) + Send + Sync,
{
    fn on_state_update(&self, state: &SessionState) {
        self(state)
    }
}

#[derive(Default)]
pub struct ListenerSet {
    entries: Mutex<Vec<(ListenerId, Arc<dyn SessionStateListener>)>>,
}

impl ListenerSet {
    pub fn add(&self, listener: Arc<dyn SessionStateListener>) -> ListenerId {
        let id = Uuid::new_v4();
        self.entries.lock().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(k, _)| *k != id);
        entries.len() != before
    }

    /// Registration order is preserved.
    pub fn snapshot(&self) -> Vec<Arc<dyn SessionStateListener>> {
        self.entries.lock().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::InstallRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn add_remove_and_snapshot() {
        let set = ListenerSet::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = set.add(Arc::new(move |_: &SessionState| {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(set.len(), 1);

        let state = SessionState::pending(&InstallRequest::builder().module("a").build());
        for l in set.snapshot() {
            l.on_state_update(&state);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }
}
