//! Synchronous key-value backend abstraction.

use std::collections::BTreeMap;

use parking_lot::Mutex;

/// Backend fault. Only [`KvStore`] implementations produce these;
/// [`MessageStore`](crate::MessageStore) logs and swallows them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// String-valued key-value storage partitioned by namespace.
///
/// Calls are synchronous and expected to be fast (local disk or memory).
pub trait KvStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError>;
    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError>;
    /// All keys in a namespace, in key order.
    fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError>;
    fn clear(&self, namespace: &str) -> Result<(), StoreError>;
}

/// In-memory backend. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: Mutex<BTreeMap<(String, String), String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_string(), key.to_string()))
            .cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert((namespace.to_string(), key.to_string()), value.to_string());
        Ok(())
    }

    fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .remove(&(namespace.to_string(), key.to_string()));
        Ok(())
    }

    fn keys(&self, namespace: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, key)| key.clone())
            .collect())
    }

    fn clear(&self, namespace: &str) -> Result<(), StoreError> {
        self.entries.lock().retain(|(ns, _), _| ns != namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_are_isolated() {
        let kv = MemoryKv::new();
        kv.set("a", "k", "1").unwrap();
        kv.set("b", "k", "2").unwrap();
        assert_eq!(kv.get("a", "k").unwrap().as_deref(), Some("1"));
        assert_eq!(kv.keys("b").unwrap(), vec!["k".to_string()]);

        kv.clear("a").unwrap();
        assert!(kv.get("a", "k").unwrap().is_none());
        assert_eq!(kv.get("b", "k").unwrap().as_deref(), Some("2"));
    }
}
