use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::storage::Storage;

use super::{PersistedCell, PersistedList, PersistedMap};

/// An application registers each persisted cell by name at construction,
/// rather than a cell being discovered by reflection over a struct's
/// fields.
///
/// Also detects the "two cells declared with the same storage key"
/// mistake: registration logs a warning but both cells keep working
/// independently (last write to storage wins).
pub struct CellRegistry {
    storage: Rc<dyn Storage>,
    keys_by_name: RefCell<HashMap<String, String>>,
}

impl CellRegistry {
    pub fn new(storage: Rc<dyn Storage>) -> Self {
        CellRegistry {
            storage,
            keys_by_name: RefCell::new(HashMap::new()),
        }
    }

    fn register(&self, name: &str, key: &str) {
        let mut keys = self.keys_by_name.borrow_mut();
        if let Some((existing_name, _)) = keys.iter().find(|(_, k)| k.as_str() == key) {
            warn!(
                key,
                existing = %existing_name,
                new = name,
                "two persisted cells declared with the same storage key; this is a programmer error, both cells remain independently functional"
            );
        }
        keys.insert(name.to_string(), key.to_string());
    }

    pub fn scalar<T>(&self, name: &str, key: impl Into<String>, initial_value: T) -> PersistedCell<T>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned + 'static,
    {
        let key = key.into();
        self.register(name, &key);
        PersistedCell::new(Rc::clone(&self.storage), key, initial_value)
    }

    pub fn map<K, V>(&self, name: &str, key: impl Into<String>) -> PersistedMap<K, V>
    where
        K: Eq + std::hash::Hash + Clone + Serialize + DeserializeOwned + 'static,
        V: Clone + Serialize + DeserializeOwned + 'static,
    {
        let key = key.into();
        self.register(name, &key);
        PersistedMap::new(Rc::clone(&self.storage), key)
    }

    pub fn list<T>(&self, name: &str, key: impl Into<String>) -> PersistedList<T>
    where
        T: Clone + Serialize + DeserializeOwned + 'static,
    {
        let key = key.into();
        self.register(name, &key);
        PersistedList::new(Rc::clone(&self.storage), key)
    }
}
