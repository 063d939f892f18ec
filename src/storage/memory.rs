use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use async_trait::async_trait;

use super::{Kv, RecordStore, StorageResult};

/// Process-local, non-durable storage backend. Used for tests and for
/// clients that opt out of persistence entirely.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    kv: Rc<RefCell<HashMap<String, String>>>,
    records: Rc<RefCell<HashMap<String, HashMap<String, String>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait(?Send)]
impl Kv for MemoryStorage {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.kv.borrow().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        self.kv.borrow_mut().insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        self.kv.borrow_mut().remove(key);
        Ok(())
    }

    async fn clear(&self) -> StorageResult<()> {
        self.kv.borrow_mut().clear();
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .kv
            .borrow()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[async_trait(?Send)]
impl RecordStore for MemoryStorage {
    async fn set_record(&self, store: &str, id: &str, value: &str) -> StorageResult<()> {
        self.records
            .borrow_mut()
            .entry(store.to_string())
            .or_default()
            .insert(id.to_string(), value.to_string());
        Ok(())
    }

    async fn get_record(&self, store: &str, id: &str) -> StorageResult<Option<String>> {
        Ok(self
            .records
            .borrow()
            .get(store)
            .and_then(|records| records.get(id))
            .cloned())
    }

    async fn delete_record(&self, store: &str, id: &str) -> StorageResult<()> {
        if let Some(records) = self.records.borrow_mut().get_mut(store) {
            records.remove(id);
        }
        Ok(())
    }

    async fn get_records(&self, store: &str) -> StorageResult<Vec<(String, String)>> {
        Ok(self
            .records
            .borrow()
            .get(store)
            .map(|records| records.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn set_records(&self, store: &str, records: Vec<(String, String)>) -> StorageResult<()> {
        let mut guard = self.records.borrow_mut();
        let target = guard.entry(store.to_string()).or_default();
        for (id, value) in records {
            target.insert(id, value);
        }
        Ok(())
    }

    async fn delete_records(&self, store: &str, ids: &[String]) -> StorageResult<()> {
        if let Some(records) = self.records.borrow_mut().get_mut(store) {
            for id in ids {
                records.remove(id);
            }
        }
        Ok(())
    }

    async fn clear_store(&self, store: &str) -> StorageResult<()> {
        self.records.borrow_mut().remove(store);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get_roundtrips() {
        let storage = MemoryStorage::new();
        storage.set("a", "1").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), Some("1".to_string()));
    }

    #[tokio::test]
    async fn keys_with_prefix_filters() {
        let storage = MemoryStorage::new();
        storage.set("posts:1", "a").await.unwrap();
        storage.set("posts:2", "b").await.unwrap();
        storage.set("users:1", "c").await.unwrap();
        let mut keys = storage.keys_with_prefix("posts:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["posts:1".to_string(), "posts:2".to_string()]);
    }

    #[tokio::test]
    async fn records_are_scoped_per_store() {
        let storage = MemoryStorage::new();
        storage.set_record("posts", "1", "{}").await.unwrap();
        storage.set_record("users", "1", "{}").await.unwrap();
        assert_eq!(storage.get_records("posts").await.unwrap().len(), 1);
        storage.clear_store("posts").await.unwrap();
        assert_eq!(storage.get_records("posts").await.unwrap().len(), 0);
        assert_eq!(storage.get_records("users").await.unwrap().len(), 1);
    }
}
