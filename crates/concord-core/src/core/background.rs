//! Background state store.
//!
//! Holds the full state of every session that is not in the foreground.
//! Events for those sessions are applied to their entry in place, so a
//! session switched back to shows everything that streamed while hidden.

use std::collections::HashMap;

use crate::core::session::{SessionId, SessionState};

#[derive(Debug, Default)]
pub struct BackgroundStore {
    snapshots: HashMap<SessionId, SessionState>,
}

impl BackgroundStore {
    /// Stores a session's state, replacing any earlier snapshot.
    pub fn capture(&mut self, state: SessionState) {
        self.snapshots.insert(state.id().clone(), state);
    }

    /// Takes a snapshot out of the store.
    pub fn restore(&mut self, id: &SessionId) -> Option<SessionState> {
        self.snapshots.remove(id)
    }

    /// Drops a snapshot once its backend is torn down.
    pub fn evict(&mut self, id: &SessionId) -> Option<SessionState> {
        self.snapshots.remove(id)
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionState> {
        self.snapshots.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut SessionState> {
        self.snapshots.get_mut(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.snapshots.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.snapshots.values()
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::{EngineKind, SessionMeta};
    use crate::core::timeline::CanonicalMessage;

    fn state(text: &str) -> SessionState {
        let mut state = SessionState::new(SessionMeta::new("/p", EngineKind::Claude, None), true);
        state
            .timeline
            .push(CanonicalMessage::user(text, Vec::new(), false));
        state
    }

    #[test]
    fn capture_overwrites_and_restore_takes() {
        let mut store = BackgroundStore::default();
        let first = state("one");
        let id = first.id().clone();
        let mut second = first.clone();
        second
            .timeline
            .push(CanonicalMessage::system("later"));

        store.capture(first);
        store.capture(second.clone());
        assert_eq!(store.len(), 1);

        let restored = store.restore(&id).unwrap();
        assert_eq!(restored.timeline, second.timeline);
        assert!(store.restore(&id).is_none());
    }

    #[test]
    fn evict_forgets_the_session() {
        let mut store = BackgroundStore::default();
        let s = state("one");
        let id = s.id().clone();
        store.capture(s);

        assert!(store.evict(&id).is_some());
        assert!(!store.contains(&id));
    }
}
