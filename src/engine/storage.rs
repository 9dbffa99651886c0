// Cojoin Engine — Session Storage
//
// Tab-scoped key/value storage, as `sessionStorage` is in a browser. The
// chatbot keeps its transcript, open/minimized state and conversation nonce
// here so they survive a minimize or reload but not a close.

use crate::atoms::error::{EngineError, EngineResult};
use log::warn;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;

pub trait SessionStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> EngineResult<()>;
    fn remove(&self, key: &str);
}

/// In-process store with an optional byte quota (keys + values).
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(bytes: usize) -> Self {
        MemoryStore { entries: Mutex::new(HashMap::new()), quota: Some(bytes) }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> EngineResult<()> {
        let mut entries = self.entries.lock();
        if let Some(quota) = self.quota {
            let used: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if used + key.len() + value.len() > quota {
                return Err(EngineError::Other(format!("storage quota exceeded writing '{}'", key)));
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

/// Read and decode a JSON value. Corrupt entries are removed.
pub fn load_json<T: DeserializeOwned>(store: &dyn SessionStore, key: &str) -> Option<T> {
    let raw = store.get(key)?;
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("[chat] Discarding corrupt '{}' entry: {}", key, e);
            store.remove(key);
            None
        }
    }
}

/// Encode and write. Storage failures are logged, never surfaced.
pub fn save_json<T: Serialize>(store: &dyn SessionStore, key: &str, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(EngineError::from)
        .and_then(|s| store.set(key, &s));
    if let Err(e) = result {
        warn!("[chat] Could not persist '{}': {}", key, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupt_json_is_cleared() {
        let store = MemoryStore::new();
        store.set("chatHistory", "{not json").unwrap();
        assert!(load_json::<Vec<String>>(&store, "chatHistory").is_none());
        assert!(store.get("chatHistory").is_none());
    }

    #[test]
    fn quota_rejects_oversized_writes() {
        let store = MemoryStore::with_quota(16);
        assert!(store.set("k", "small").is_ok());
        assert!(store.set("k2", "this value is too large").is_err());
        // overwriting a key does not double count it
        assert!(store.set("k", "replaced").is_ok());
    }

    #[test]
    fn save_then_load() {
        let store = MemoryStore::new();
        save_json(&store, "xs", &vec![1, 2, 3]);
        assert_eq!(load_json::<Vec<i32>>(&store, "xs"), Some(vec![1, 2, 3]));
    }
}
