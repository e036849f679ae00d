//! Result stores: where background jobs leave their output.

use std::fmt;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;

use crate::error::ManagerError;

/// Key-value storage with optional expiry.
///
/// Writes must be atomic per key: a reader sees either the old value or the
/// complete new one.
pub trait ResultStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Value>, ManagerError>;

    fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> Result<(), ManagerError>;

    /// Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<(), ManagerError>;

    /// Restarts the expiry clock of an existing entry.
    fn touch(&self, key: &str, expire: Option<Duration>) -> Result<(), ManagerError>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, Entry>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultStore for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Value>, ManagerError> {
        let now = Instant::now();
        let live = self
            .entries
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                self.entries.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: Value, expire: Option<Duration>) -> Result<(), ManagerError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: expire.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), ManagerError> {
        self.entries.remove(key);
        Ok(())
    }

    fn touch(&self, key: &str, expire: Option<Duration>) -> Result<(), ManagerError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = expire.map(|d| Instant::now() + d);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_get_delete() {
        let store = MemoryBackend::new();
        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", json!({"x": 1}), None).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(json!({"x": 1})));
        assert_eq!(store.len(), 1);
        store.delete("a").unwrap();
        store.delete("a").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn entries_expire() {
        let store = MemoryBackend::new();
        store.set("a", json!(1), Some(Duration::ZERO)).unwrap();
        assert_eq!(store.get("a").unwrap(), None);

        store.set("b", json!(2), Some(Duration::ZERO)).unwrap();
        store.touch("b", None).unwrap();
        assert_eq!(store.get("b").unwrap(), Some(json!(2)));
    }
}
