//! In-memory response cache for idempotent reads.
//!
//! Entries have no TTL; they live until explicitly deleted or the cache is
//! cleared (logout, forced logout). Keys are a pure function of endpoint
//! path and query parameters so repeated reads land on the same entry.

use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;

/// Deterministic cache key for `(path, params)`. Parameter order does not
/// matter: same path and same params always produce the same key.
pub fn cache_key(path: &str, params: &[(String, String)]) -> String {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    pairs.sort();
    format!("{}?{}", path, pairs.join("&"))
}

#[derive(Default)]
pub struct ResponseCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().expect("response cache poisoned");
        entries.get(key).cloned()
    }

    pub fn set(&self, key: &str, value: Value) {
        let mut entries = self.entries.write().expect("response cache poisoned");
        entries.insert(key.to_string(), value);
    }

    pub fn delete(&self, key: &str) {
        let mut entries = self.entries.write().expect("response cache poisoned");
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write().expect("response cache poisoned");
        entries.clear();
    }
}
