//! Token persistence backends.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

pub const ACCESS_TOKEN_KEY: &str = "accessToken";
pub const LAST_ACTIVITY_KEY: &str = "lastActivity";

/// Where the client keeps its access token and idle clock between runs.
pub trait TokenStorage: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);
}

/// Volatile storage. Everything vanishes with the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStorage for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.values.lock().insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.values.lock().remove(key);
    }
}

/// A single JSON file holding all keys. The lock keeps concurrent
/// read-modify-write cycles from interleaving.
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> HashMap<String, String> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn store(&self, values: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(values) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist token storage");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode token storage"),
        }
    }
}

impl TokenStorage for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        let _guard = self.lock.lock();
        self.load().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        let _guard = self.lock.lock();
        let mut values = self.load();
        values.insert(key.to_string(), value.to_string());
        self.store(&values);
    }

    fn remove(&self, key: &str) {
        let _guard = self.lock.lock();
        let mut values = self.load();
        if values.remove(key).is_some() {
            self.store(&values);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trip() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);

        storage.set(ACCESS_TOKEN_KEY, "abc");
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), Some("abc".to_string()));

        storage.remove(ACCESS_TOKEN_KEY);
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);
    }

    #[test]
    fn file_storage_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");

        let storage = FileStorage::new(&path);
        storage.set(ACCESS_TOKEN_KEY, "abc");
        storage.set(LAST_ACTIVITY_KEY, "12345");
        drop(storage);

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get(ACCESS_TOKEN_KEY), Some("abc".to_string()));
        assert_eq!(reopened.get(LAST_ACTIVITY_KEY), Some("12345".to_string()));
    }

    #[test]
    fn file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("nope.json"));
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);
        // Removing a key that was never stored is a no-op
        storage.remove(ACCESS_TOKEN_KEY);
    }

    #[test]
    fn file_storage_tolerates_corrupt_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        std::fs::write(&path, "not json").unwrap();

        let storage = FileStorage::new(&path);
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);
        storage.set(ACCESS_TOKEN_KEY, "abc");
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), Some("abc".to_string()));
    }
}
