use std::collections::HashMap;
use std::hash::Hash;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::reactive::Cell;
use crate::storage::Storage;

use super::controller::PersistenceController;

/// A map-valued cell. Every mutating operation saves the whole map
/// (JSON-encoded) under one storage key.
pub struct PersistedMap<K, V> {
    cell: Cell<HashMap<K, V>>,
    controller: Rc<PersistenceController<HashMap<K, V>>>,
}

impl<K, V> PersistedMap<K, V>
where
    K: Eq + Hash + Clone + Serialize + DeserializeOwned + 'static,
    V: Clone + Serialize + DeserializeOwned + 'static,
{
    pub fn new(storage: Rc<dyn Storage>, key: impl Into<String>) -> Self {
        PersistedMap {
            cell: Cell::new(HashMap::new()),
            controller: Rc::new(PersistenceController::new(
                storage,
                key,
                |v: &HashMap<K, V>| serde_json::to_string(v).unwrap_or_default(),
                |raw| serde_json::from_str(raw).map_err(|e| e.to_string()),
            )),
        }
    }

    fn ensure_hydrated(&self) {
        self.controller.ensure_hydrated(self.cell.clone(), false, None);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.ensure_hydrated();
        self.cell.with(|m| m.get(key).cloned())
    }

    pub fn entries(&self) -> HashMap<K, V> {
        self.ensure_hydrated();
        self.cell.get()
    }

    pub fn insert(&self, key: K, value: V) {
        self.ensure_hydrated();
        self.cell.mutate(|m| {
            m.insert(key, value);
        });
        self.save();
    }

    pub fn remove(&self, key: &K) {
        self.ensure_hydrated();
        self.cell.mutate(|m| {
            m.remove(key);
        });
        self.save();
    }

    pub fn clear(&self) {
        self.ensure_hydrated();
        self.cell.mutate(|m| m.clear());
        self.save();
    }

    pub async fn wait_for_hydration(&self) {
        self.ensure_hydrated();
        self.controller.wait_for_hydration().await;
    }

    fn save(&self) {
        let snapshot = self.cell.get_untracked();
        self.controller.save(&snapshot);
    }
}
