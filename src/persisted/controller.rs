//! Composition point shared by the scalar/map/list persisted cells: owns
//! storage I/O, the at-most-once hydration future, and the coalesced save
//! queue. Each cell kind wraps one of these rather than inheriting from a
//! shared persistence base.

use std::rc::Rc;

use tokio::sync::Notify;
use tracing::warn;

use crate::reactive::Cell;
use crate::storage::Storage;

enum SaveState {
    Idle,
    InFlight { pending: Option<String> },
}

/// Drives hydration and coalesced saves for one storage key. `T` is the
/// value type of the cell this controller backs; encode/decode are
/// supplied by the cell (JSON by default, or a custom codec).
pub struct PersistenceController<T> {
    storage: Rc<dyn Storage>,
    key: String,
    encode: Box<dyn Fn(&T) -> String>,
    decode: Box<dyn Fn(&str) -> Result<T, String>>,
    hydration_started: std::cell::RefCell<bool>,
    hydrated: std::cell::RefCell<bool>,
    notify: Rc<Notify>,
    save_state: Rc<std::cell::RefCell<SaveState>>,
}

impl<T: 'static> PersistenceController<T> {
    pub fn new(
        storage: Rc<dyn Storage>,
        key: impl Into<String>,
        encode: impl Fn(&T) -> String + 'static,
        decode: impl Fn(&str) -> Result<T, String> + 'static,
    ) -> Self {
        PersistenceController {
            storage,
            key: key.into(),
            encode: Box::new(encode),
            decode: Box::new(decode),
            hydration_started: std::cell::RefCell::new(false),
            hydrated: std::cell::RefCell::new(false),
            notify: Rc::new(Notify::new()),
            save_state: Rc::new(std::cell::RefCell::new(SaveState::Idle)),
        }
    }

    pub fn is_hydrated(&self) -> bool {
        *self.hydrated.borrow()
    }

    /// Kick off hydration exactly once. Safe to call from every read; the
    /// second and later calls are no-ops. Never blocks: the cell is
    /// updated from a spawned local task once the load completes.
    pub fn ensure_hydrated(
        self: &Rc<Self>,
        cell: Cell<T>,
        clear_cache: bool,
        error_handler: Option<Rc<dyn Fn(String)>>,
    ) where
        T: Clone,
    {
        if *self.hydration_started.borrow() {
            return;
        }
        *self.hydration_started.borrow_mut() = true;

        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            if clear_cache {
                let _ = this.storage.delete(&this.key).await;
            } else {
                match this.storage.get(&this.key).await {
                    Ok(Some(raw)) => match (this.decode)(&raw) {
                        Ok(value) => cell.replace(value),
                        Err(e) => {
                            warn!(key = %this.key, error = %e, "persisted cell decode failed, keeping default");
                            if let Some(handler) = &error_handler {
                                handler(e);
                            }
                        }
                    },
                    Ok(None) => {}
                    Err(e) => {
                        warn!(key = %this.key, error = %e, "persisted cell hydration load failed, keeping default");
                        if let Some(handler) = &error_handler {
                            handler(e.to_string());
                        }
                    }
                }
            }
            *this.hydrated.borrow_mut() = true;
            this.notify.notify_waiters();
        });
    }

    /// Resolves once the first hydration attempt (success or failure) has
    /// completed. Immediate if already hydrated.
    pub async fn wait_for_hydration(&self) {
        if self.is_hydrated() {
            return;
        }
        loop {
            let notified = self.notify.notified();
            if self.is_hydrated() {
                return;
            }
            notified.await;
            if self.is_hydrated() {
                return;
            }
        }
    }

    /// Encode `value` and enqueue a fire-and-forget save. While a save for
    /// this key is already in flight, only the most recent pending value is
    /// kept (save coalescing).
    pub fn save(self: &Rc<Self>, value: &T) {
        let encoded = (self.encode)(value);
        let mut state = self.save_state.borrow_mut();
        match &mut *state {
            SaveState::Idle => {
                *state = SaveState::InFlight { pending: None };
                drop(state);
                self.spawn_save_loop(encoded);
            }
            SaveState::InFlight { pending } => {
                *pending = Some(encoded);
            }
        }
    }

    fn spawn_save_loop(self: &Rc<Self>, mut encoded: String) {
        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            loop {
                if let Err(e) = this.storage.set(&this.key, &encoded).await {
                    warn!(key = %this.key, error = %e, "persisted cell save failed, in-memory value remains authoritative");
                }
                let next = {
                    let mut state = this.save_state.borrow_mut();
                    match &mut *state {
                        SaveState::InFlight { pending } => pending.take(),
                        SaveState::Idle => None,
                    }
                };
                match next {
                    Some(value) => encoded = value,
                    None => {
                        *this.save_state.borrow_mut() = SaveState::Idle;
                        break;
                    }
                }
            }
        });
    }

    pub async fn clear(&self) {
        if let Err(e) = self.storage.delete(&self.key).await {
            warn!(key = %self.key, error = %e, "persisted cell clear failed");
        }
    }
}
