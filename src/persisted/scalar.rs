use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::reactive::Cell;
use crate::storage::Storage;

use super::controller::PersistenceController;

/// A scalar value that hydrates from storage on first read and saves on
/// every write. Construct with [`PersistedCell::new`] for the default JSON
/// codec, or [`PersistedCell::with_codec`] for a custom one.
pub struct PersistedCell<T> {
    cell: Cell<T>,
    controller: Rc<PersistenceController<T>>,
    clear_cache: bool,
    error_handler: Option<Rc<dyn Fn(String)>>,
}

impl<T> PersistedCell<T>
where
    T: Clone + PartialEq + Serialize + DeserializeOwned + 'static,
{
    pub fn new(storage: Rc<dyn Storage>, key: impl Into<String>, initial_value: T) -> Self {
        Self::with_codec(
            storage,
            key,
            initial_value,
            |v| serde_json::to_string(v).unwrap_or_default(),
            |raw| serde_json::from_str(raw).map_err(|e| e.to_string()),
        )
    }
}

impl<T: Clone + PartialEq + 'static> PersistedCell<T> {
    pub fn with_codec(
        storage: Rc<dyn Storage>,
        key: impl Into<String>,
        initial_value: T,
        encode: impl Fn(&T) -> String + 'static,
        decode: impl Fn(&str) -> Result<T, String> + 'static,
    ) -> Self {
        PersistedCell {
            cell: Cell::new(initial_value),
            controller: Rc::new(PersistenceController::new(storage, key, encode, decode)),
            clear_cache: false,
            error_handler: None,
        }
    }

    /// Skip loading from storage and asynchronously delete the key instead.
    pub fn clear_cache(mut self, clear_cache: bool) -> Self {
        self.clear_cache = clear_cache;
        self
    }

    pub fn on_error(mut self, handler: impl Fn(String) + 'static) -> Self {
        self.error_handler = Some(Rc::new(handler));
        self
    }

    /// Current value. Triggers hydration as a side effect on first call;
    /// never blocks — returns the declared default until hydration settles.
    pub fn get(&self) -> T {
        self.controller
            .ensure_hydrated(self.cell.clone(), self.clear_cache, self.error_handler.clone());
        self.cell.get()
    }

    pub fn get_untracked(&self) -> T {
        self.controller
            .ensure_hydrated(self.cell.clone(), self.clear_cache, self.error_handler.clone());
        self.cell.get_untracked()
    }

    /// Write a new value: updates the cell synchronously and enqueues a
    /// fire-and-forget, coalesced save.
    pub fn set(&self, value: T) {
        self.cell.set(value.clone());
        self.controller.save(&value);
    }

    pub async fn wait_for_hydration(&self) {
        self.controller
            .ensure_hydrated(self.cell.clone(), self.clear_cache, self.error_handler.clone());
        self.controller.wait_for_hydration().await;
    }

    pub fn is_hydrated(&self) -> bool {
        self.controller.is_hydrated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn roundtrips_through_storage() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage: Rc<dyn Storage> = Rc::new(MemoryStorage::new());
                let count = PersistedCell::new(storage.clone(), "count", 0);
                count.wait_for_hydration().await;
                assert_eq!(count.get(), 0);
                count.set(5);

                let reopened = PersistedCell::new(storage, "count", 0);
                reopened.wait_for_hydration().await;
                assert_eq!(reopened.get(), 5);
            })
            .await;
    }

    #[tokio::test]
    async fn decode_failure_keeps_declared_default() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage: Rc<dyn Storage> = Rc::new(MemoryStorage::new());
                storage.init().await.unwrap();
                storage.set("broken", "not json").await.unwrap();

                let cell = PersistedCell::new(storage, "broken", 42);
                cell.wait_for_hydration().await;
                assert_eq!(cell.get(), 42);
            })
            .await;
    }
}
