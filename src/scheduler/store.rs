//! Latest-result store.

use super::{ProbeResult, ResultProvider, TargetKey};

use parking_lot::RwLock;
use std::collections::HashMap;

/// Thread-safe map holding the most recent result per target.
#[derive(Default)]
pub struct ResultStore {
    items: RwLock<HashMap<TargetKey, ProbeResult>>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored result for the result's target.
    pub fn put(&self, result: ProbeResult) {
        let key = result.key();
        self.items.write().insert(key, result);
    }

    /// Copy of every stored result; the lock is released before returning.
    pub fn snapshot(&self) -> Vec<ProbeResult> {
        self.items.read().values().cloned().collect()
    }
}

impl ResultProvider for ResultStore {
    fn snapshot(&self) -> Vec<ProbeResult> {
        ResultStore::snapshot(self)
    }
}
