//! The abstract multi-value store a slave keeps its mapped data in between the map and reduce
//! phases of one task. The concrete persistent engine is pluggable; an in-memory implementation
//! is provided for tests and demos.

use std::collections::HashMap;
use std::sync::Mutex;

/// A multi-value store keyed by string. `insert` appends, `read` returns every value ever
/// inserted for the key, `terminate` releases the store's resources. One logical instance per
/// slave per task, spanning the map and reduce phases.
pub trait SlaveStorage<V>: Send + Sync {
    fn insert(&self, key: &str, value: V);

    fn read(&self, key: &str) -> Vec<V>;

    fn terminate(&self);
}

/// A storage backend held entirely in memory.
pub struct MemoryStorage<V> {
    entries: Mutex<HashMap<String, Vec<V>>>,
}

impl<V> MemoryStorage<V> {
    pub fn new() -> Self {
        MemoryStorage { entries: Mutex::new(HashMap::new()) }
    }
}

impl<V> Default for MemoryStorage<V> {
    fn default() -> Self {
        MemoryStorage::new()
    }
}

impl<V: Clone + Send> SlaveStorage<V> for MemoryStorage<V> {
    fn insert(&self, key: &str, value: V) {
        let mut entries = self.entries.lock().expect("storage lock poisoned");
        entries.entry(key.to_string()).or_insert_with(Vec::new).push(value);
    }

    fn read(&self, key: &str) -> Vec<V> {
        let entries = self.entries.lock().expect("storage lock poisoned");
        entries.get(key).cloned().unwrap_or_default()
    }

    fn terminate(&self) {
        self.entries.lock().expect("storage lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_appends_and_read_returns_all() {
        let storage = MemoryStorage::new();
        storage.insert("k", 1);
        storage.insert("k", 2);
        storage.insert("other", 3);

        assert_eq!(vec![1, 2], storage.read("k"));
        assert_eq!(vec![3], storage.read("other"));
        assert!(storage.read("missing").is_empty());
    }

    #[test]
    fn terminate_releases_everything() {
        let storage = MemoryStorage::new();
        storage.insert("k", 1);
        storage.terminate();
        assert!(storage.read("k").is_empty());
    }
}
