use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Prevents duplicate initialization of the same (broadcast, viewer) pair
/// across redundant lifecycle invocations. An entry is inserted before any
/// join I/O starts and removed on both successful leave and failed join, so
/// a pair can always attempt a fresh join later.
#[derive(Clone, Default)]
pub struct JoinRegistry {
    inner: Arc<Mutex<HashSet<(String, String)>>>,
}

impl JoinRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns false if the pair is already initializing or joined.
    pub fn try_insert(&self, broadcast_id: &str, viewer_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .insert((broadcast_id.to_string(), viewer_id.to_string()))
    }

    pub fn remove(&self, broadcast_id: &str, viewer_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .remove(&(broadcast_id.to_string(), viewer_id.to_string()));
    }

    pub fn contains(&self, broadcast_id: &str, viewer_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .contains(&(broadcast_id.to_string(), viewer_id.to_string()))
    }
}
