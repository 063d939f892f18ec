//! The cache-wide entry point: `fetch_query`/`prefetch_query`/
//! `invalidate_queries`/`set_query_data`/`update_query_data`/
//! `cancel_query` and friends, all operating on the single
//! fingerprint-keyed [`Arena`] shared by every key.

use std::any::Any;
use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::entry::{Arena, Entry, EntryStatus};
use crate::error::FetchError;
use crate::garbage_collector;
use crate::handle::QueryHandle;
use crate::infinite_query::InfiniteQueryHandle;
use crate::mutation::MutationHandle;
use crate::persisted_cache::{self, PersistedEntrySnapshot, PersistedQueryCache};
use crate::query::{cancel_in_flight, execute_fetch};
use crate::query_key::QueryKey;
use crate::query_options::{ClientConfig, LogLevel, QueryOptions};
use crate::storage::Storage;

/// Owns the cache arena and the client-wide defaults every query and
/// mutation is created against. Cheap to clone: internally it is just an
/// `Rc` handle onto shared state, so it can be passed by value through an
/// application's dependency-injection context.
#[derive(Clone)]
pub struct Client {
    arena: Arena,
    config: Rc<ClientConfig>,
    persisted: Rc<RefCell<Option<PersistedQueryCache>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Client {
            arena: Arena::new(),
            config: Rc::new(config),
            persisted: Rc::new(RefCell::new(None)),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Load the persisted query cache snapshot from `storage` and make it
    /// available to [`Client::rehydrate_query_data`]. Entries past
    /// their `cache_duration` are dropped before this returns. Call once at
    /// startup, before building any query handles that should hydrate from
    /// it.
    pub async fn init(&self, storage: Rc<dyn Storage>) {
        let snapshot = persisted_cache::load_cache_snapshot(storage.as_ref()).await;
        *self.persisted.borrow_mut() = Some(PersistedQueryCache::new(storage, snapshot));
    }

    /// Serialize `key`'s current data into the persisted query cache and
    /// schedule a debounced/throttled write-back. A no-op if
    /// [`Client::init`] was never called or the entry has no data yet.
    pub fn persist_query_data<V: Serialize + 'static>(&self, key: &QueryKey) {
        let guard = self.persisted.borrow();
        let Some(cache) = guard.as_ref() else {
            return;
        };
        let Some(entry) = self.arena.get(&key.fingerprint()) else {
            return;
        };
        let Some(data) = entry.downcast_data::<V>() else {
            return;
        };
        let Some(updated_at) = entry.updated_at.get_untracked() else {
            return;
        };
        let Ok(json) = serde_json::to_value(&*data) else {
            return;
        };
        let updated_at_millis = duration_since_epoch_millis(updated_at);
        let cache_duration = entry.cache_duration.get();
        cache.mark_dirty(
            entry.fingerprint.clone(),
            PersistedEntrySnapshot {
                key_tokens: key.tokens().to_vec(),
                data: json,
                updated_at_millis,
                stale_duration_millis: entry.stale_duration.get().as_millis() as u64,
                cache_duration_millis: if cache_duration == Duration::MAX {
                    u64::MAX
                } else {
                    cache_duration.as_millis() as u64
                },
            },
        );
    }

    /// Populate `key`'s entry from the snapshot loaded by [`Client::init`],
    /// preserving the original `updated_at` so staleness reflects the
    /// data's real age rather than the moment it was rehydrated. Returns
    /// `true` if a snapshot was found and applied.
    pub fn rehydrate_query_data<V: DeserializeOwned + 'static>(&self, key: impl Into<QueryKey>) -> bool {
        let key = key.into();
        let guard = self.persisted.borrow();
        let Some(cache) = guard.as_ref() else {
            return false;
        };
        let Some(snapshot) = cache.get(&key.fingerprint()) else {
            return false;
        };
        let Ok(value) = serde_json::from_value::<V>(snapshot.data.clone()) else {
            return false;
        };

        let entry = self.arena.get_or_create(&key, snapshot.stale_duration(), snapshot.cache_duration());
        entry.bump_generation();
        entry.cancel.borrow_mut().take();
        entry.data.replace(Some(Rc::new(value) as Rc<dyn Any>));
        entry.error.replace(None);
        entry.status.set(EntryStatus::Success);
        entry.updated_at.replace(Some(instant_from_epoch_millis(snapshot.updated_at_millis)));
        entry.settled.notify_waiters();
        true
    }

    fn entry_for(&self, key: &QueryKey, options: &QueryOptions) -> Rc<Entry> {
        let stale = options.stale_duration.unwrap_or(self.config.default_stale_duration);
        let cache = options.cache_duration.unwrap_or(self.config.default_cache_duration);
        let is_new = self.arena.get(&key.fingerprint()).is_none();
        let entry = self.arena.get_or_create(key, stale, cache);
        entry.stale_duration.set(stale);
        garbage_collector::update_cache_duration(&entry, Some(cache));

        if is_new {
            let level = options.log_level.unwrap_or(self.config.log_level);
            if level.allows(LogLevel::Debug) {
                tracing::debug!(key = ?key.tokens(), fingerprint = %entry.fingerprint, "query entry created");
            }
        }

        entry
    }

    /// Fill in client-wide defaults (`request_timeout` and `log_level`) that
    /// `options` left unset, so a client's `ClientConfig` actually reaches
    /// the fetch loop instead of the crate-wide constant/default.
    fn resolve_options(&self, mut options: QueryOptions) -> QueryOptions {
        if options.request_timeout.is_none() {
            options.request_timeout = Some(self.config.request_timeout);
        }
        if options.log_level.is_none() {
            options.log_level = Some(self.config.log_level);
        }
        options
    }

    /// Build a reactive handle over `key`, creating its arena entry lazily
    /// if this is the first observer: entries are created on first read,
    /// not at construction time.
    pub fn query<V, F, Fut>(&self, key: impl Into<QueryKey>, fetcher: F, options: QueryOptions) -> QueryHandle<V>
    where
        V: 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>> + 'static,
    {
        let key = key.into();
        let options = self.resolve_options(options);
        let entry = self.entry_for(&key, &options);
        QueryHandle::new(self.clone(), entry, Rc::new(fetcher), options)
    }

    /// Build a paginated query handle over `key`, creating its arena entry
    /// lazily on first observation, same as [`Client::query`].
    pub fn infinite_query<V, P, F, Fut, N>(
        &self,
        key: impl Into<QueryKey>,
        fetch_page: F,
        initial_page_param: P,
        get_next_page_param: N,
        options: QueryOptions,
    ) -> InfiniteQueryHandle<V, P>
    where
        V: Clone + 'static,
        P: Clone + 'static,
        F: Fn(P) -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>> + 'static,
        N: Fn(&V, &[V]) -> Option<P> + 'static,
    {
        let key = key.into();
        let options = self.resolve_options(options);
        let entry = self.entry_for(&key, &options);
        InfiniteQueryHandle::new(entry, self.arena.clone(), fetch_page, initial_page_param, get_next_page_param, options)
    }

    /// Build a mutation handle bound to no particular cache entry; it
    /// invalidates/updates entries explicitly via its success callback.
    pub fn mutation<V, A, F, Fut>(&self, mutate_fn: F) -> MutationHandle<V, A>
    where
        V: 'static,
        A: 'static,
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>> + 'static,
    {
        MutationHandle::new(self.clone(), Rc::new(mutate_fn))
    }

    /// Start (or await, if already in flight) a fetch for `key` without
    /// constructing a handle, and return once it settles. Used to warm the
    /// cache ahead of a read.
    pub async fn prefetch_query<V, F, Fut>(&self, key: impl Into<QueryKey>, fetcher: F, options: QueryOptions)
    where
        V: 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>>,
    {
        let key = key.into();
        let options = self.resolve_options(options);
        let entry = self.entry_for(&key, &options);
        if entry.is_fetching.get_untracked() {
            entry.settled.notified().await;
            return;
        }
        if !entry.is_stale(Instant::now()) {
            return;
        }
        execute_fetch::<V, _, _>(entry, fetcher, options).await;
    }

    /// Equivalent to `prefetch_query`, but always fetches regardless of
    /// staleness.
    pub async fn fetch_query<V, F, Fut>(&self, key: impl Into<QueryKey>, fetcher: F, options: QueryOptions)
    where
        V: 'static,
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>>,
    {
        let key = key.into();
        let options = self.resolve_options(options);
        let entry = self.entry_for(&key, &options);
        execute_fetch::<V, _, _>(entry, fetcher, options).await;
    }

    /// Read an entry's current data without subscribing to it, if present
    /// and of the expected type.
    pub fn get_query_data<V: 'static>(&self, key: &QueryKey) -> Option<Rc<V>> {
        self.arena.get(&key.fingerprint()).and_then(|e| e.downcast_data::<V>())
    }

    /// Overwrite an entry's data directly, superseding any in-flight fetch
    /// and marking it fresh. Creates the entry if it does not exist yet.
    pub fn set_query_data<V: 'static>(&self, key: impl Into<QueryKey>, value: V) {
        let key = key.into();
        let entry = self
            .arena
            .get_or_create(&key, self.config.default_stale_duration, self.config.default_cache_duration);
        entry.bump_generation();
        entry.cancel.borrow_mut().take();
        entry.data.replace(Some(Rc::new(value) as Rc<dyn Any>));
        entry.error.replace(None);
        entry.status.set(EntryStatus::Success);
        entry.updated_at.replace(Some(Instant::now()));
        entry.settled.notify_waiters();
    }

    /// Transform an entry's current data in place, if present and of the
    /// expected type.
    pub fn update_query_data<V, U>(&self, key: &QueryKey, updater: U)
    where
        V: Clone + 'static,
        U: FnOnce(&V) -> V,
    {
        if let Some(current) = self.get_query_data::<V>(key) {
            self.set_query_data(key.clone(), updater(&current));
        }
    }

    /// Mark every entry whose key has `key` as a prefix stale. Entries with
    /// at least one active subscriber additionally have their registered
    /// refetch trigger fired immediately, rather than waiting for the next
    /// read to notice the staleness.
    pub fn invalidate_queries(&self, key: &QueryKey) {
        for entry in self.arena.matching_prefix(key) {
            entry.updated_at.replace(None);
            if entry.subscriber_count.get() > 0 {
                if let Some(trigger) = entry.refetch_trigger.borrow().clone() {
                    trigger(Rc::clone(&entry));
                }
            }
        }
    }

    /// Remove every entry whose key has `key` as a prefix from the cache
    /// entirely, cancelling any in-flight fetch first.
    pub fn remove_queries(&self, key: &QueryKey) {
        for entry in self.arena.matching_prefix(key) {
            cancel_in_flight(&entry);
            self.arena.remove(&entry.fingerprint);
        }
    }

    /// Cancel whatever fetch is in flight for `key`, if any, leaving the
    /// entry's last-known data and status untouched.
    pub fn cancel_query(&self, key: &QueryKey) {
        if let Some(entry) = self.arena.get(&key.fingerprint()) {
            cancel_in_flight(&entry);
        }
    }

    /// Forward an application-level "window regained focus" signal. A no-op
    /// unless `ClientConfig::refetch_on_window_focus` is set; there is no
    /// window for this crate to observe on its own, so the embedder calls
    /// this explicitly from whatever platform hook it has (visibility
    /// change, app-resume, …). Refetches every stale, subscribed entry.
    pub fn on_window_focus(&self) {
        if self.config.refetch_on_window_focus {
            self.refetch_stale_subscribed();
        }
    }

    /// Forward an application-level "network connectivity restored"
    /// signal. A no-op unless `ClientConfig::refetch_on_reconnect` is set.
    pub fn on_network_reconnect(&self) {
        if self.config.refetch_on_reconnect {
            self.refetch_stale_subscribed();
        }
    }

    fn refetch_stale_subscribed(&self) {
        let now = Instant::now();
        for entry in self.arena.all() {
            if entry.subscriber_count.get() == 0 || !entry.is_stale(now) {
                continue;
            }
            if let Some(trigger) = entry.refetch_trigger.borrow().clone() {
                trigger(Rc::clone(&entry));
            }
        }
    }

    pub(crate) fn arena(&self) -> &Arena {
        &self.arena
    }
}

/// `Instant` is monotonic and has no fixed origin, so persisting an
/// `updated_at` means bridging it to wall-clock time via the current
/// instant/system-time pair at the moment of conversion.
fn duration_since_epoch_millis(instant: Instant) -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let age = Instant::now().saturating_duration_since(instant);
    let system_time = SystemTime::now().checked_sub(age).unwrap_or(UNIX_EPOCH);
    system_time.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

fn instant_from_epoch_millis(millis: u64) -> Instant {
    use std::time::{SystemTime, UNIX_EPOCH};
    let target = UNIX_EPOCH + Duration::from_millis(millis);
    let age = SystemTime::now().duration_since(target).unwrap_or_default();
    Instant::now().checked_sub(age).unwrap_or_else(Instant::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_query_data_creates_entry_with_fresh_status() {
        let client = Client::new(ClientConfig::default());
        let key: QueryKey = ["posts", "1"].into();
        client.set_query_data(key.clone(), "hello".to_string());
        assert_eq!(*client.get_query_data::<String>(&key).unwrap(), "hello");
    }

    #[test]
    fn invalidate_queries_marks_matching_prefix_stale() {
        let client = Client::new(ClientConfig::default());
        let key: QueryKey = ["posts", "1"].into();
        client.set_query_data(key.clone(), 1i32);
        let entry = client.arena.get(&key.fingerprint()).unwrap();
        assert!(!entry.is_stale(Instant::now()));
        client.invalidate_queries(&["posts"].into());
        assert!(entry.is_stale(Instant::now()));
    }

    #[test]
    fn remove_queries_drops_matching_entries() {
        let client = Client::new(ClientConfig::default());
        let key: QueryKey = ["posts", "1"].into();
        client.set_query_data(key.clone(), 1i32);
        client.remove_queries(&["posts"].into());
        assert!(client.get_query_data::<i32>(&key).is_none());
    }

    #[tokio::test]
    async fn invalidate_queries_refetches_subscribed_entries_immediately() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let calls = Rc::new(std::cell::Cell::new(0));
                let calls_clone = Rc::clone(&calls);
                let handle = client.query(
                    ["posts"],
                    move || {
                        calls_clone.set(calls_clone.get() + 1);
                        async { Ok::<_, crate::error::FetchError>(1i32) }
                    },
                    QueryOptions::default(),
                );
                handle.wait_for_hydration().await;
                assert_eq!(calls.get(), 1);

                let settled = handle.entry.settled.notified();
                client.invalidate_queries(&["posts"].into());
                settled.await;
                assert_eq!(calls.get(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn on_window_focus_refetches_stale_subscribed_entries_when_enabled() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut config = ClientConfig::default();
                config.refetch_on_window_focus = true;
                config.default_stale_duration = Duration::from_millis(0);
                let client = Client::new(config);
                let calls = Rc::new(std::cell::Cell::new(0));
                let calls_clone = Rc::clone(&calls);
                let handle = client.query(
                    ["posts"],
                    move || {
                        calls_clone.set(calls_clone.get() + 1);
                        async { Ok::<_, crate::error::FetchError>(1i32) }
                    },
                    QueryOptions::default(),
                );
                handle.wait_for_hydration().await;
                assert_eq!(calls.get(), 1);

                let settled = handle.entry.settled.notified();
                client.on_window_focus();
                settled.await;
                assert_eq!(calls.get(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn on_window_focus_is_noop_when_disabled() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut config = ClientConfig::default();
                config.default_stale_duration = Duration::from_millis(0);
                let client = Client::new(config);
                let calls = Rc::new(std::cell::Cell::new(0));
                let calls_clone = Rc::clone(&calls);
                let handle = client.query(
                    ["posts"],
                    move || {
                        calls_clone.set(calls_clone.get() + 1);
                        async { Ok::<_, crate::error::FetchError>(1i32) }
                    },
                    QueryOptions::default(),
                );
                handle.wait_for_hydration().await;
                client.on_window_focus();
                tokio::task::yield_now().await;
                assert_eq!(calls.get(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn invalidate_queries_does_not_refetch_unsubscribed_entries() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let key: QueryKey = ["posts"].into();
                client.set_query_data(key.clone(), 1i32);
                client.invalidate_queries(&["posts"].into());
                // No subscriber, so there is no registered trigger and
                // nothing should be scheduled; the entry is simply stale.
                let entry = client.arena.get(&key.fingerprint()).unwrap();
                assert!(entry.is_stale(Instant::now()));
                assert!(entry.refetch_trigger.borrow().is_none());
            })
            .await;
    }
}
