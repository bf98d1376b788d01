//! ResultCache (§4.9): bounded map from a task's `key` to its cached
//! output, owned solely by the scheduler's pump (§5) — no internal
//! synchronisation needed.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

#[derive(Debug, Clone)]
pub struct CachedResult {
    pub output: Value,
    pub completed_at_ms: u64,
}

pub struct ResultCache {
    entries: HashMap<Arc<str>, CachedResult>,
    max_size: usize,
}

impl ResultCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            max_size,
        }
    }

    pub fn get(&self, key: &str) -> Option<&CachedResult> {
        self.entries.get(key)
    }

    /// Error results are never stored (§4.9) — callers only ever `put` a
    /// successful output.
    pub fn put(&mut self, key: Arc<str>, output: Value, completed_at_ms: u64) {
        self.entries.insert(key, CachedResult { output, completed_at_ms });
        if self.entries.len() > self.max_size {
            self.evict_oldest_80_percent();
        }
    }

    /// Evicts the oldest 80% by `completed_at_ms` in one pass, amortising
    /// eviction cost instead of evicting one entry at a time.
    fn evict_oldest_80_percent(&mut self) {
        let mut by_age: Vec<(Arc<str>, u64)> =
            self.entries.iter().map(|(k, v)| (Arc::clone(k), v.completed_at_ms)).collect();
        by_age.sort_by_key(|(_, t)| *t);

        let evict_count = ((by_age.len() as f64) * 0.8).ceil() as usize;
        for (key, _) in by_age.into_iter().take(evict_count) {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
