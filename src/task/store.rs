//! Task store: concurrency-safe mapping from task id to handle.
//!
//! Handles live here from a successful Start (or Recover) until a
//! successful Destroy. Nothing is persisted; the driver state returned to
//! the orchestrator is the recovery mechanism.

use crate::task::handle::TaskHandle;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory task-id → handle map behind a reader/writer lock.
#[derive(Default)]
pub struct TaskStore {
    store: RwLock<HashMap<String, Arc<TaskHandle>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the handle for a task id.
    pub fn set(&self, id: &str, handle: Arc<TaskHandle>) {
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.to_string(), handle);
    }

    /// Looks up the handle for a task id.
    pub fn get(&self, id: &str) -> Option<Arc<TaskHandle>> {
        self.store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// True when a handle exists for the task id.
    pub fn contains(&self, id: &str) -> bool {
        self.store
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Removes the handle for a task id.
    pub fn delete(&self, id: &str) {
        self.store
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}
