//! Which writers are currently online, as reported by the swarm.
//!
//! Entries are only ever inserted or overwritten. A writer that was seen
//! once stays in the map until the process restarts.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct ConnectedPeers {
    peers: Mutex<HashMap<String, bool>>,
}

impl ConnectedPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, connected: bool) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), connected);
    }

    pub fn is_connected(&self, key: &str) -> bool {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(false)
    }
}
