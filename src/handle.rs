//! `QueryHandle<V>`, the reactive view an application reads a query
//! through.
//!
//! Subscribing bumps the entry's subscriber count, which suppresses
//! garbage collection for as long as the handle is held; every reactive
//! field reads through the shared [`Cell`](crate::reactive::Cell)/
//! [`Computed`](crate::reactive::Computed) substrate.

use std::future::Future;
use std::rc::Rc;
use std::time::Instant;

use crate::client::Client;
use crate::entry::{Entry, EntryStatus};
use crate::error::{FetchError, QueryError};
use crate::garbage_collector;
use crate::query::execute_fetch;
use crate::query_options::QueryOptions;
use crate::reactive::{effect, DisposeHandle};

type BoxFetcher<V> = Rc<dyn Fn() -> std::pin::Pin<Box<dyn Future<Output = Result<V, FetchError>>>>>;

/// A live subscription to one cache entry. Holding a handle keeps the
/// entry's subscriber count above zero, which suppresses garbage
/// collection; dropping or explicitly [`dispose`](Self::dispose)-ing it
/// lets GC reclaim the entry once its `cache_duration` elapses.
pub struct QueryHandle<V> {
    client: Client,
    pub(crate) entry: Rc<Entry>,
    fetcher: BoxFetcher<V>,
    options: QueryOptions,
    disposed: bool,
}

impl<V: 'static> QueryHandle<V> {
    pub(crate) fn new<F, Fut>(client: Client, entry: Rc<Entry>, fetcher: Rc<F>, options: QueryOptions) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>> + 'static,
    {
        entry.subscriber_count.set(entry.subscriber_count.get() + 1);
        garbage_collector::cancel_gc(&entry);

        let boxed: BoxFetcher<V> = Rc::new(move || Box::pin((fetcher)()) as std::pin::Pin<Box<dyn Future<Output = _>>>);

        let handle = QueryHandle {
            client,
            entry,
            fetcher: boxed,
            options,
            disposed: false,
        };

        handle.register_refetch_trigger();

        // No `!is_fetching` guard here: at construction time the entry's
        // `is_fetching` flag only flips once a previously spawned fetch task
        // has actually been polled, so two handles constructed back to back
        // would both see it false. The dedup guard lives in `execute_fetch`
        // itself, which every `start_fetch` call below runs through.
        if handle.options.enabled && handle.entry.is_stale(Instant::now()) {
            handle.start_fetch();
        }
        handle.schedule_refetch_timer();

        handle
    }

    /// Store a closure on the entry that `Client::invalidate_queries` can
    /// call to schedule a background refetch without knowing `V`. Overwrites
    /// whatever a previous observer of this key registered; cleared in
    /// `do_dispose` once the last subscriber leaves.
    fn register_refetch_trigger(&self) {
        let fetcher = Rc::clone(&self.fetcher);
        let options = self.options.clone();
        let trigger: Rc<dyn Fn(Rc<Entry>)> = Rc::new(move |entry: Rc<Entry>| {
            if entry.is_fetching.get_untracked() {
                return;
            }
            let fetcher = Rc::clone(&fetcher);
            let options = options.clone();
            tokio::task::spawn_local(async move {
                execute_fetch::<V, _, _>(entry, move || (fetcher)(), options).await;
            });
        });
        *self.entry.refetch_trigger.borrow_mut() = Some(trigger);
    }

    fn start_fetch(&self) {
        let entry = Rc::clone(&self.entry);
        let fetcher = Rc::clone(&self.fetcher);
        let options = self.options.clone();
        tokio::task::spawn_local(async move {
            execute_fetch::<V, _, _>(entry, move || (fetcher)(), options).await;
        });
    }

    /// Reschedule `entry.refetch_timer` per `options.refetch_interval`.
    /// Fires once per interval, after the previous fetch settles, for as
    /// long as this handle stays alive; `dispose`/`Drop` cancels it.
    fn schedule_refetch_timer(&self) {
        let Some(interval) = self.options.refetch_interval else {
            return;
        };
        if let Some(old) = self.entry.refetch_timer.borrow_mut().take() {
            old.abort();
        }
        let entry = Rc::clone(&self.entry);
        let fetcher = Rc::clone(&self.fetcher);
        let options = self.options.clone();
        let join = tokio::task::spawn_local(async move {
            loop {
                tokio::time::sleep(interval).await;
                execute_fetch::<V, _, _>(Rc::clone(&entry), || (fetcher)(), options.clone()).await;
            }
        });
        *self.entry.refetch_timer.borrow_mut() = Some(join);
    }

    /// Register dependency cells for signal-driven invalidation:
    /// `read_deps` should read every cell
    /// the query depends on so the returned effect re-runs on any of their
    /// changes. Each re-run after the first marks the entry stale, and,
    /// when `options.refetch_on_signal_change` is set, immediately starts a
    /// refetch. Returns a [`DisposeHandle`] the caller should hold for as
    /// long as the watch should stay active.
    pub fn watch_signals(&self, read_deps: impl Fn() + 'static) -> DisposeHandle {
        let entry = Rc::clone(&self.entry);
        let fetcher = Rc::clone(&self.fetcher);
        let options = self.options.clone();
        let refetch_on_change = options.refetch_on_signal_change;
        let first_run = Rc::new(std::cell::Cell::new(true));

        effect(move || {
            read_deps();
            if first_run.get() {
                first_run.set(false);
                return;
            }
            entry.updated_at.replace(None);
            if refetch_on_change && !entry.is_fetching.get_untracked() {
                let entry = Rc::clone(&entry);
                let fetcher = Rc::clone(&fetcher);
                let options = options.clone();
                tokio::task::spawn_local(async move {
                    execute_fetch::<V, _, _>(entry, move || (fetcher)(), options).await;
                });
            }
        })
    }

    /// Current lifecycle status.
    pub fn status(&self) -> EntryStatus {
        self.entry.status.get()
    }

    /// Last successfully fetched value, if any and if it downcasts to `V`
    /// (it always does, for a handle obtained through [`Client::query`]).
    pub fn data(&self) -> Option<Rc<V>> {
        self.entry.data.get().and_then(|d| d.downcast::<V>().ok())
    }

    pub fn error(&self) -> Option<QueryError> {
        self.entry.error.get()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.status(), EntryStatus::Loading)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status(), EntryStatus::Success)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status(), EntryStatus::Error | EntryStatus::Timeout | EntryStatus::NetworkError)
    }

    pub fn is_fetching(&self) -> bool {
        self.entry.is_fetching.get()
    }

    pub fn is_stale(&self) -> bool {
        self.entry.is_stale(Instant::now())
    }

    /// Force a refetch regardless of current staleness.
    pub fn refetch(&self) {
        self.start_fetch();
    }

    /// Resolve once the current (or next, if none is in flight and the
    /// entry is stale) fetch settles.
    pub async fn wait_for_hydration(&self) {
        if self.entry.is_fetching.get_untracked() {
            self.entry.settled.notified().await;
            return;
        }
        if self.entry.data.get_untracked().is_none() {
            self.refetch();
            self.entry.settled.notified().await;
        }
    }

    /// Release this subscription. The entry's GC timer is (re)scheduled if
    /// this was the last subscriber.
    pub fn dispose(mut self) {
        self.do_dispose();
    }

    fn do_dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        let count = self.entry.subscriber_count.get().saturating_sub(1);
        self.entry.subscriber_count.set(count);
        if count == 0 {
            if let Some(timer) = self.entry.refetch_timer.borrow_mut().take() {
                timer.abort();
            }
            self.entry.refetch_trigger.borrow_mut().take();
            garbage_collector::schedule_gc(Rc::clone(&self.entry), self.client.arena().clone());
        }
    }
}

impl<V> Drop for QueryHandle<V> {
    fn drop(&mut self) {
        self.do_dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_options::ClientConfig;

    #[tokio::test]
    async fn fresh_handle_fetches_immediately() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let handle = client.query(["posts"], || async { Ok::<_, FetchError>(7i32) }, QueryOptions::default());
                handle.wait_for_hydration().await;
                assert!(handle.is_success());
                assert_eq!(*handle.data().unwrap(), 7);
            })
            .await;
    }

    #[tokio::test]
    async fn dispose_schedules_gc_when_last_subscriber_leaves() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let mut config = ClientConfig::default();
                config.default_cache_duration = std::time::Duration::from_millis(20);
                let client = Client::new(config);
                let handle = client.query(["posts"], || async { Ok::<_, FetchError>(1i32) }, QueryOptions::default());
                handle.wait_for_hydration().await;
                let key: crate::query_key::QueryKey = ["posts"].into();
                drop(handle);
                tokio::time::sleep(std::time::Duration::from_millis(40)).await;
                assert!(client.get_query_data::<i32>(&key).is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn refetch_interval_polls_repeatedly() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let calls = Rc::new(std::cell::Cell::new(0));
                let calls_clone = Rc::clone(&calls);
                let options = QueryOptions::default().refetch_interval(std::time::Duration::from_millis(15));
                let handle = client.query(
                    ["polled"],
                    move || {
                        calls_clone.set(calls_clone.get() + 1);
                        async { Ok::<_, FetchError>(1i32) }
                    },
                    options,
                );
                handle.wait_for_hydration().await;
                tokio::time::sleep(std::time::Duration::from_millis(60)).await;
                assert!(calls.get() >= 2, "expected multiple polls, got {}", calls.get());
            })
            .await;
    }

    #[tokio::test]
    async fn watch_signals_marks_stale_and_refetches_on_change() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let dep = crate::reactive::Cell::new(1i32);
                let calls = Rc::new(std::cell::Cell::new(0));
                let calls_clone = Rc::clone(&calls);
                let mut options = QueryOptions::default();
                options.refetch_on_signal_change = true;
                let handle = client.query(
                    ["signaled"],
                    move || {
                        calls_clone.set(calls_clone.get() + 1);
                        async { Ok::<_, FetchError>(1i32) }
                    },
                    options,
                );
                handle.wait_for_hydration().await;
                assert_eq!(calls.get(), 1);

                let dep_clone = dep.clone();
                let _watch = handle.watch_signals(move || {
                    dep_clone.get();
                });

                let settled = handle.entry.settled.notified();
                dep.set(2);
                settled.await;
                assert_eq!(calls.get(), 2);
            })
            .await;
    }

    #[tokio::test]
    async fn concurrent_handles_for_same_key_dedup_the_fetch() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let calls = Rc::new(std::cell::Cell::new(0));

                let calls_a = Rc::clone(&calls);
                let handle_a = client.query(
                    ["shared"],
                    move || {
                        calls_a.set(calls_a.get() + 1);
                        async {
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok::<_, FetchError>(1i32)
                        }
                    },
                    QueryOptions::default(),
                );
                let calls_b = Rc::clone(&calls);
                let handle_b = client.query(
                    ["shared"],
                    move || {
                        calls_b.set(calls_b.get() + 1);
                        async {
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok::<_, FetchError>(1i32)
                        }
                    },
                    QueryOptions::default(),
                );

                handle_a.wait_for_hydration().await;
                handle_b.wait_for_hydration().await;

                assert_eq!(calls.get(), 1, "fetcher should run once for two overlapping subscribers");
                assert_eq!(*handle_a.data().unwrap(), 1);
                assert_eq!(*handle_b.data().unwrap(), 1);
            })
            .await;
    }
}
