//! State storage for the ephemeral variant.
//!
//! The engine never touches a global map directly; it goes through
//! [`StateStore`], keyed by conversation id. The in-memory implementation is
//! the demo default. Callers own the concurrency discipline: two requests
//! for the same conversation key must not be processed at once.

use std::collections::HashMap;
use std::sync::Mutex;

use super::EphemeralState;

/// Get/put state by conversation key.
pub trait StateStore: Send + Sync {
    fn get(&self, conversation_id: &str) -> Option<EphemeralState>;
    fn put(&self, conversation_id: &str, state: EphemeralState);
}

/// Process-local state store backed by a mutexed map.
#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, EphemeralState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn get(&self, conversation_id: &str) -> Option<EphemeralState> {
        self.states
            .lock()
            .expect("state store lock poisoned")
            .get(conversation_id)
            .cloned()
    }

    fn put(&self, conversation_id: &str, state: EphemeralState) {
        self.states
            .lock()
            .expect("state store lock poisoned")
            .insert(conversation_id.to_string(), state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_what_put_stored() {
        let store = InMemoryStateStore::new();
        assert!(store.get("conv-1").is_none());

        let mut state = EphemeralState::default();
        state.last_processed_index = 3;
        store.put("conv-1", state);

        assert_eq!(store.get("conv-1").unwrap().last_processed_index, 3);
        assert!(store.get("conv-2").is_none());
    }
}
