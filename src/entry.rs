//! The type-erased cache record and the arena that owns it.
//!
//! Every cached value, regardless of its concrete type, lives in one
//! `HashMap<String, Rc<Entry>>` keyed by the query key's string
//! fingerprint, with `data` erased behind `Rc<dyn Any>`; handles downcast
//! back to their expected type at the read boundary.

use std::any::Any;
use std::cell::{Cell as StdCell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::QueryError;
use crate::query_key::QueryKey;
use crate::reactive::Cell;

/// Observable status of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Idle,
    Loading,
    Success,
    Error,
    Timeout,
    NetworkError,
}

pub(crate) struct Entry {
    pub key: QueryKey,
    pub fingerprint: String,
    pub data: Cell<Option<Rc<dyn Any>>>,
    pub error: Cell<Option<QueryError>>,
    pub status: Cell<EntryStatus>,
    pub is_fetching: Cell<bool>,
    pub updated_at: Cell<Option<Instant>>,
    pub errored_at: Cell<Option<Instant>>,
    pub stale_duration: StdCell<Duration>,
    pub cache_duration: StdCell<Duration>,
    pub refetch_interval: RefCell<Option<Duration>>,
    /// Bumped on every supersede (`set_query_data`, a fresh fetch attempt
    /// starting, or removal). A completing fetch compares its captured
    /// generation against this before writing back; a mismatch means it
    /// was superseded and its result is dropped.
    pub generation: StdCell<u64>,
    pub cancel: RefCell<Option<futures_channel::oneshot::Sender<()>>>,
    pub subscriber_count: StdCell<usize>,
    pub gc_timer: RefCell<Option<JoinHandle<()>>>,
    pub refetch_timer: RefCell<Option<JoinHandle<()>>>,
    /// Notified every time a fetch attempt settles, so concurrent callers
    /// (dedup) and `wait_for_hydration()` can await the shared result.
    pub settled: Rc<Notify>,
    /// Set by the most recently constructed subscribed handle, cleared when
    /// the last subscriber disposes. Lets `Client::invalidate_queries`
    /// schedule a background refetch for a subscribed entry without itself
    /// knowing the entry's erased value type.
    pub refetch_trigger: RefCell<Option<Rc<dyn Fn(Rc<Entry>)>>>,
}

impl Entry {
    pub fn new(key: QueryKey, fingerprint: String, stale_duration: Duration, cache_duration: Duration) -> Self {
        Entry {
            key,
            fingerprint,
            data: Cell::new(None),
            error: Cell::new(None),
            status: Cell::new(EntryStatus::Idle),
            is_fetching: Cell::new(false),
            updated_at: Cell::new(None),
            errored_at: Cell::new(None),
            stale_duration: StdCell::new(stale_duration),
            cache_duration: StdCell::new(cache_duration),
            refetch_interval: RefCell::new(None),
            generation: StdCell::new(0),
            cancel: RefCell::new(None),
            subscriber_count: StdCell::new(0),
            gc_timer: RefCell::new(None),
            refetch_timer: RefCell::new(None),
            settled: Rc::new(Notify::new()),
            refetch_trigger: RefCell::new(None),
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        match self.updated_at.get_untracked() {
            Some(updated_at) => now.duration_since(updated_at) >= self.stale_duration.get(),
            None => true,
        }
    }

    pub fn bump_generation(&self) -> u64 {
        let next = self.generation.get() + 1;
        self.generation.set(next);
        if let Some(cancel) = self.cancel.borrow_mut().take() {
            let _ = cancel.send(());
        }
        next
    }

    pub fn downcast_data<V: 'static>(&self) -> Option<Rc<V>> {
        self.data.get_untracked().and_then(|d| d.downcast::<V>().ok())
    }
}

/// The client's arena: every live query entry, keyed by the fingerprint of
/// its [`QueryKey`].
#[derive(Clone, Default)]
pub(crate) struct Arena {
    entries: Rc<RefCell<std::collections::HashMap<String, Rc<Entry>>>>,
}

impl Arena {
    pub fn new() -> Self {
        Arena::default()
    }

    pub fn get(&self, fingerprint: &str) -> Option<Rc<Entry>> {
        self.entries.borrow().get(fingerprint).cloned()
    }

    pub fn get_or_create(
        &self,
        key: &QueryKey,
        default_stale: Duration,
        default_cache: Duration,
    ) -> Rc<Entry> {
        let fingerprint = key.fingerprint();
        if let Some(entry) = self.entries.borrow().get(&fingerprint) {
            return Rc::clone(entry);
        }
        let entry = Rc::new(Entry::new(key.clone(), fingerprint.clone(), default_stale, default_cache));
        self.entries.borrow_mut().insert(fingerprint, Rc::clone(&entry));
        entry
    }

    pub fn remove(&self, fingerprint: &str) -> Option<Rc<Entry>> {
        self.entries.borrow_mut().remove(fingerprint)
    }

    /// Every entry whose key has `prefix` as a [`QueryKey`] prefix.
    pub fn matching_prefix(&self, prefix: &QueryKey) -> Vec<Rc<Entry>> {
        self.entries
            .borrow()
            .values()
            .filter(|e| prefix.is_prefix_of(&e.key))
            .cloned()
            .collect()
    }

    /// Every live entry, regardless of key. Used by the window-focus/
    /// reconnect hooks, which sweep the whole arena rather than a prefix.
    pub fn all(&self) -> Vec<Rc<Entry>> {
        self.entries.borrow().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}
