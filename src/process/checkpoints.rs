// src/process/checkpoints.rs — Bounded per-session rewind points

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_CHECKPOINT_CAPACITY: usize = 100;

/// Ordered, de-duplicated user-message uuids per session. Oldest entries are
/// evicted once a list exceeds its capacity.
pub struct CheckpointLedger {
    capacity: usize,
    lists: Mutex<HashMap<String, VecDeque<String>>>,
}

impl Default for CheckpointLedger {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_CAPACITY)
    }
}

impl CheckpointLedger {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lists: Mutex::new(HashMap::new()),
        }
    }

    fn lists(&self) -> MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        self.lists.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a checkpoint. Returns false if it was already recorded.
    pub fn add(&self, session_id: &str, checkpoint_id: &str) -> bool {
        let mut lists = self.lists();
        let list = lists.entry(session_id.to_string()).or_default();
        if list.iter().any(|c| c == checkpoint_id) {
            return false;
        }
        list.push_back(checkpoint_id.to_string());
        while list.len() > self.capacity {
            list.pop_front();
        }
        true
    }

    pub fn list(&self, session_id: &str) -> Vec<String> {
        self.lists()
            .get(session_id)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.lists().remove(session_id);
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
