use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::reactive::Cell;
use crate::storage::Storage;

use super::controller::PersistenceController;

/// A list-valued cell. By default the whole list is saved as one JSON
/// string per mutation; in granular mode each item is written individually
/// through the storage record API, keyed by `id_of`, with no cross-item
/// write atomicity guaranteed.
pub struct PersistedList<T> {
    cell: Cell<Vec<T>>,
    controller: Rc<PersistenceController<Vec<T>>>,
    granular: Option<Granular<T>>,
}

struct Granular<T> {
    storage: Rc<dyn Storage>,
    store_name: String,
    id_of: Rc<dyn Fn(&T) -> String>,
}

impl<T> PersistedList<T>
where
    T: Clone + Serialize + DeserializeOwned + 'static,
{
    pub fn new(storage: Rc<dyn Storage>, key: impl Into<String>) -> Self {
        PersistedList {
            cell: Cell::new(Vec::new()),
            controller: Rc::new(PersistenceController::new(
                storage,
                key,
                |v: &Vec<T>| serde_json::to_string(v).unwrap_or_default(),
                |raw| serde_json::from_str(raw).map_err(|e| e.to_string()),
            )),
            granular: None,
        }
    }

    /// Opt into the record-store-backed layout: each item is written to its
    /// own record in `store_name`, identified by `id_of`.
    pub fn granular(mut self, storage: Rc<dyn Storage>, store_name: impl Into<String>, id_of: impl Fn(&T) -> String + 'static) -> Self {
        self.granular = Some(Granular {
            storage,
            store_name: store_name.into(),
            id_of: Rc::new(id_of),
        });
        self
    }

    fn ensure_hydrated(&self) {
        self.controller.ensure_hydrated(self.cell.clone(), false, None);
    }

    pub fn items(&self) -> Vec<T> {
        self.ensure_hydrated();
        self.cell.get()
    }

    pub fn push(&self, item: T) {
        self.ensure_hydrated();
        self.cell.mutate(|v| v.push(item));
        self.save();
    }

    pub fn remove(&self, index: usize) {
        self.ensure_hydrated();
        self.cell.mutate(|v| {
            if index < v.len() {
                v.remove(index);
            }
        });
        self.save();
    }

    pub fn clear(&self) {
        self.ensure_hydrated();
        self.cell.mutate(|v| v.clear());
        self.save();
    }

    pub async fn wait_for_hydration(&self) {
        self.ensure_hydrated();
        self.controller.wait_for_hydration().await;
    }

    fn save(&self) {
        let snapshot = self.cell.get_untracked();
        if let Some(granular) = &self.granular {
            let storage = Rc::clone(&granular.storage);
            let store_name = granular.store_name.clone();
            let id_of = Rc::clone(&granular.id_of);
            tokio::task::spawn_local(async move {
                let records: Vec<(String, String)> = snapshot
                    .iter()
                    .map(|item| (id_of(item), serde_json::to_string(item).unwrap_or_default()))
                    .collect();
                if let Err(e) = storage.set_records(&store_name, records).await {
                    tracing::warn!(store = %store_name, error = %e, "granular list save failed");
                }
            });
        } else {
            self.controller.save(&snapshot);
        }
    }
}
