//! `InfiniteQueryHandle<V, P>`, the paginated counterpart to [`QueryHandle`].
//!
//! Pagination is page-param-driven: the caller supplies an initial page
//! parameter and a function deriving the next one from the last page
//! fetched so far, rather than a fixed offset/limit scheme. The entry's
//! type-erased `data` slot stores an [`InfiniteData<V, P>`] the same way a
//! plain query stores its `V` — [`InfiniteQueryHandle`] just downcasts to
//! that wider type instead of `V` directly.

use std::any::Any;
use std::future::Future;
use std::rc::Rc;
use std::time::Instant;

use futures::future::{select, Either};
use futures_channel::oneshot;

use crate::entry::{Arena, Entry, EntryStatus};
use crate::error::{classify, FetchError, QueryError, QueryErrorKind};
use crate::query_options::QueryOptions;

/// A sequence of fetched pages plus the page parameter each one was fetched
/// with.
#[derive(Debug, Clone)]
pub struct InfiniteData<V, P> {
    pub pages: Vec<V>,
    pub page_params: Vec<P>,
}

impl<V, P> InfiniteData<V, P> {
    pub fn new(first_page: V, first_param: P) -> Self {
        InfiniteData {
            pages: vec![first_page],
            page_params: vec![first_param],
        }
    }

    pub fn add_page(&mut self, page: V, param: P) {
        self.pages.push(page);
        self.page_params.push(param);
    }

    pub fn prepend_page(&mut self, page: V, param: P) {
        self.pages.insert(0, page);
        self.page_params.insert(0, param);
    }

    pub fn replace_page(&mut self, index: usize, page: V) {
        if let Some(slot) = self.pages.get_mut(index) {
            *slot = page;
        }
    }

    pub fn flat_map<U>(&self, f: impl Fn(&V) -> Vec<U>) -> Vec<U> {
        self.pages.iter().flat_map(f).collect()
    }
}

type PageFetcher<V, P> = Rc<dyn Fn(P) -> std::pin::Pin<Box<dyn Future<Output = Result<V, FetchError>>>>>;
type NextPageParamFn<V, P> = Rc<dyn Fn(&V, &[V]) -> Option<P>>;
type PrevPageParamFn<V, P> = Rc<dyn Fn(&V, &[V]) -> Option<P>>;

/// Observable view over a paginated cache entry. Exposes the same status
/// fields as [`QueryHandle`](crate::handle::QueryHandle) plus page-direction
/// fetch state.
pub struct InfiniteQueryHandle<V, P> {
    entry: Rc<Entry>,
    arena: Arena,
    fetch_page: PageFetcher<V, P>,
    get_next_page_param: NextPageParamFn<V, P>,
    get_previous_page_param: Option<PrevPageParamFn<V, P>>,
    initial_page_param: P,
    options: QueryOptions,
    is_fetching_next: Rc<std::cell::Cell<bool>>,
    is_fetching_previous: Rc<std::cell::Cell<bool>>,
    disposed: std::cell::Cell<bool>,
}

impl<V: Clone + 'static, P: Clone + 'static> InfiniteQueryHandle<V, P> {
    pub(crate) fn new<F, Fut, N>(
        entry: Rc<Entry>,
        arena: Arena,
        fetch_page: F,
        initial_page_param: P,
        get_next_page_param: N,
        options: QueryOptions,
    ) -> Self
    where
        F: Fn(P) -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>> + 'static,
        N: Fn(&V, &[V]) -> Option<P> + 'static,
    {
        entry.subscriber_count.set(entry.subscriber_count.get() + 1);
        crate::garbage_collector::cancel_gc(&entry);

        let boxed: PageFetcher<V, P> = Rc::new(move |param| Box::pin((fetch_page)(param)) as std::pin::Pin<Box<dyn Future<Output = _>>>);

        let handle = InfiniteQueryHandle {
            entry,
            arena,
            fetch_page: boxed,
            get_next_page_param: Rc::new(get_next_page_param),
            get_previous_page_param: None,
            initial_page_param,
            options,
            is_fetching_next: Rc::new(std::cell::Cell::new(false)),
            is_fetching_previous: Rc::new(std::cell::Cell::new(false)),
            disposed: std::cell::Cell::new(false),
        };

        handle.register_refetch_trigger();

        // `run_single_page`/`refetch_all_pages` carry their own dedup guard,
        // so no `!is_fetching` check is needed here (see `QueryHandle::new`).
        if handle.options.enabled && handle.data().is_none() {
            handle.fetch_initial();
        }

        handle
    }

    /// Store a closure on the entry so `Client::invalidate_queries` can
    /// schedule a whole-pages refetch without knowing `V`/`P`. See
    /// `QueryHandle::register_refetch_trigger` for the same pattern on a
    /// plain query entry.
    fn register_refetch_trigger(&self) {
        let fetch_page = Rc::clone(&self.fetch_page);
        let options = self.options.clone();
        let trigger: Rc<dyn Fn(Rc<Entry>)> = Rc::new(move |entry: Rc<Entry>| {
            if entry.is_fetching.get_untracked() {
                return;
            }
            let Some(current) = entry.downcast_data::<InfiniteData<V, P>>() else {
                return;
            };
            let params = current.page_params.clone();
            let fetch_page = Rc::clone(&fetch_page);
            let options = options.clone();
            tokio::task::spawn_local(async move {
                refetch_all_pages::<V, P>(entry, fetch_page, params, options).await;
            });
        });
        *self.entry.refetch_trigger.borrow_mut() = Some(trigger);
    }

    /// Declare a `get_previous_page_param` so [`fetch_previous_page`](Self::fetch_previous_page)
    /// becomes usable; without one `has_previous_page` is always `false`.
    pub fn with_previous_page_param(mut self, f: impl Fn(&V, &[V]) -> Option<P> + 'static) -> Self {
        self.get_previous_page_param = Some(Rc::new(f));
        self
    }

    pub fn data(&self) -> Option<Rc<InfiniteData<V, P>>> {
        self.entry.data.get().and_then(|d| d.downcast::<InfiniteData<V, P>>().ok())
    }

    pub fn status(&self) -> EntryStatus {
        self.entry.status.get()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.entry.error.get()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.status(), EntryStatus::Loading) && self.data().is_none()
    }

    pub fn is_fetching(&self) -> bool {
        self.entry.is_fetching.get()
    }

    pub fn is_fetching_next_page(&self) -> bool {
        self.is_fetching_next.get()
    }

    pub fn is_fetching_previous_page(&self) -> bool {
        self.is_fetching_previous.get()
    }

    /// Whether a next page is available at the most recently settled state.
    /// Recomputed from the last page each time, never cached independently.
    pub fn has_next_page(&self) -> bool {
        match self.data() {
            Some(data) => match data.pages.last() {
                Some(last) => (self.get_next_page_param)(last, &data.pages).is_some(),
                None => false,
            },
            None => false,
        }
    }

    pub fn has_previous_page(&self) -> bool {
        let Some(get_prev) = &self.get_previous_page_param else {
            return false;
        };
        match self.data() {
            Some(data) => match data.pages.first() {
                Some(first) => get_prev(first, &data.pages).is_some(),
                None => false,
            },
            None => false,
        }
    }

    fn fetch_initial(&self) {
        let entry = Rc::clone(&self.entry);
        let fetch_page = Rc::clone(&self.fetch_page);
        let param = self.initial_page_param.clone();
        let options = self.options.clone();
        tokio::task::spawn_local(async move {
            run_single_page::<V, P>(entry, fetch_page, param, options, PageInit::First).await;
        });
    }

    /// Fetch the next page, if one exists at the current settle and no
    /// next-page fetch is already in flight.
    pub fn fetch_next_page(&self) {
        if self.is_fetching_next.get() || !self.has_next_page() {
            return;
        }
        let Some(data) = self.data() else { return };
        let Some(last) = data.pages.last() else { return };
        let Some(next_param) = (self.get_next_page_param)(last, &data.pages) else {
            return;
        };

        self.is_fetching_next.set(true);
        let entry = Rc::clone(&self.entry);
        let fetch_page = Rc::clone(&self.fetch_page);
        let options = self.options.clone();
        let flag = Rc::clone(&self.is_fetching_next);
        tokio::task::spawn_local(async move {
            run_single_page::<V, P>(entry, fetch_page, next_param, options, PageInit::Append).await;
            flag.set(false);
        });
    }

    /// Fetch the previous page, symmetrical to [`fetch_next_page`](Self::fetch_next_page).
    pub fn fetch_previous_page(&self) {
        if self.is_fetching_previous.get() || !self.has_previous_page() {
            return;
        }
        let Some(get_prev) = &self.get_previous_page_param else {
            return;
        };
        let Some(data) = self.data() else { return };
        let Some(first) = data.pages.first() else { return };
        let Some(prev_param) = get_prev(first, &data.pages) else {
            return;
        };

        self.is_fetching_previous.set(true);
        let entry = Rc::clone(&self.entry);
        let fetch_page = Rc::clone(&self.fetch_page);
        let options = self.options.clone();
        let flag = Rc::clone(&self.is_fetching_previous);
        tokio::task::spawn_local(async move {
            run_single_page::<V, P>(entry, fetch_page, prev_param, options, PageInit::Prepend).await;
            flag.set(false);
        });
    }

    /// Re-fetch every currently-known page in order, replacing `data`
    /// atomically on success; on the first page failure, the previous
    /// `InfiniteData` is left untouched.
    pub async fn refetch(&self) {
        let Some(current) = self.data() else {
            self.fetch_initial();
            return;
        };
        let params = current.page_params.clone();
        let entry = Rc::clone(&self.entry);
        let fetch_page = Rc::clone(&self.fetch_page);
        let options = self.options.clone();
        refetch_all_pages::<V, P>(entry, fetch_page, params, options).await;
    }

    pub fn dispose(mut self) {
        self.do_dispose();
    }

    fn do_dispose(&mut self) {
        if self.disposed.get() {
            return;
        }
        self.disposed.set(true);
        let count = self.entry.subscriber_count.get().saturating_sub(1);
        self.entry.subscriber_count.set(count);
        if count == 0 {
            self.entry.refetch_trigger.borrow_mut().take();
            crate::garbage_collector::schedule_gc(Rc::clone(&self.entry), self.arena.clone());
        }
    }
}

impl<V, P> Drop for InfiniteQueryHandle<V, P> {
    fn drop(&mut self) {
        self.do_dispose();
    }
}

enum PageInit {
    First,
    Append,
    Prepend,
}

/// Fetch one page with `param` and fold it into the entry's
/// [`InfiniteData`], creating it if this is the first page.
async fn run_single_page<V, P>(entry: Rc<Entry>, fetch_page: PageFetcher<V, P>, param: P, options: QueryOptions, init: PageInit)
where
    V: Clone + 'static,
    P: Clone + 'static,
{
    if entry.is_fetching.get_untracked() {
        entry.settled.notified().await;
        return;
    }

    let generation = entry.bump_generation();
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    *entry.cancel.borrow_mut() = Some(cancel_tx);
    entry.is_fetching.set(true);

    let request_timeout = options
        .request_timeout
        .unwrap_or(crate::query_options::DEFAULT_REQUEST_TIMEOUT);

    let outcome = fetch_one::<V, P>(&fetch_page, param.clone(), request_timeout, &options, &mut cancel_rx).await;

    if entry.generation.get() != generation {
        return;
    }
    entry.is_fetching.set(false);
    entry.cancel.borrow_mut().take();

    match outcome {
        Ok(page) => {
            let merged = match init {
                PageInit::First => InfiniteData::new(page, param),
                PageInit::Append | PageInit::Prepend => {
                    let mut data = entry
                        .downcast_data::<InfiniteData<V, P>>()
                        .map(|rc| (*rc).clone())
                        .unwrap_or_else(|| InfiniteData::new(page.clone(), param.clone()));
                    match init {
                        PageInit::Append => data.add_page(page, param),
                        PageInit::Prepend => data.prepend_page(page, param),
                        PageInit::First => unreachable!(),
                    }
                    data
                }
            };
            entry.data.replace(Some(Rc::new(merged) as Rc<dyn Any>));
            entry.error.replace(None);
            entry.status.set(EntryStatus::Success);
            entry.updated_at.replace(Some(Instant::now()));
        }
        Err(err) => {
            entry.status.set(status_for_kind(err.kind));
            entry.error.replace(Some(err));
            entry.errored_at.replace(Some(Instant::now()));
        }
    }
    entry.settled.notify_waiters();
}

/// Re-fetch every page in `params` order, building a fresh `InfiniteData`
/// and swapping it in only if every page succeeds (atomic replace with
/// rollback on partial failure).
async fn refetch_all_pages<V, P>(entry: Rc<Entry>, fetch_page: PageFetcher<V, P>, params: Vec<P>, options: QueryOptions)
where
    V: Clone + 'static,
    P: Clone + 'static,
{
    if entry.is_fetching.get_untracked() {
        entry.settled.notified().await;
        return;
    }

    let generation = entry.bump_generation();
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    *entry.cancel.borrow_mut() = Some(cancel_tx);
    entry.is_fetching.set(true);

    let request_timeout = options
        .request_timeout
        .unwrap_or(crate::query_options::DEFAULT_REQUEST_TIMEOUT);

    let mut pages = Vec::with_capacity(params.len());
    let mut failure: Option<QueryError> = None;
    for param in &params {
        match fetch_one::<V, P>(&fetch_page, param.clone(), request_timeout, &options, &mut cancel_rx).await {
            Ok(page) => pages.push(page),
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    if entry.generation.get() != generation {
        return;
    }
    entry.is_fetching.set(false);
    entry.cancel.borrow_mut().take();

    match failure {
        None => {
            let data = InfiniteData {
                pages,
                page_params: params,
            };
            entry.data.replace(Some(Rc::new(data) as Rc<dyn Any>));
            entry.error.replace(None);
            entry.status.set(EntryStatus::Success);
            entry.updated_at.replace(Some(Instant::now()));
        }
        Some(err) => {
            // Roll back: leave the previously-stored `InfiniteData` as-is,
            // just surface the error alongside it.
            entry.status.set(status_for_kind(err.kind));
            entry.error.replace(Some(err));
            entry.errored_at.replace(Some(Instant::now()));
        }
    }
    entry.settled.notify_waiters();
}

async fn fetch_one<V, P>(
    fetch_page: &PageFetcher<V, P>,
    param: P,
    request_timeout: std::time::Duration,
    options: &QueryOptions,
    cancel_rx: &mut oneshot::Receiver<()>,
) -> Result<V, QueryError>
where
    P: Clone,
{
    let mut attempt = 0u32;
    loop {
        let param = param.clone();
        let attempt_fut = Box::pin(async move {
            match tokio::time::timeout(request_timeout, (fetch_page)(param)).await {
                Ok(result) => result,
                Err(_) => {
                    let mut err = FetchError::network(format!("request exceeded timeout of {request_timeout:?}"));
                    err.is_timeout = true;
                    Err(err)
                }
            }
        });

        let result = match select(attempt_fut, &mut *cancel_rx).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => return Err(QueryError::cancelled()),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(fetch_err) => {
                let kind = classify(&fetch_err);
                if options.retry.should_retry(kind, attempt) {
                    let delay = options.retry.backoff(attempt, 0.5);
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                return Err(QueryError::new(kind, fetch_err.message));
            }
        }
    }
}

fn status_for_kind(kind: QueryErrorKind) -> EntryStatus {
    match kind {
        QueryErrorKind::Timeout => EntryStatus::Timeout,
        QueryErrorKind::Network => EntryStatus::NetworkError,
        _ => EntryStatus::Error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::query_options::ClientConfig;
    use std::cell::Cell as StdCell;

    #[derive(Debug, Clone, PartialEq)]
    struct Page {
        items: Vec<i32>,
        has_more: bool,
        next_skip: usize,
    }

    #[tokio::test]
    async fn paginates_until_exhausted() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let total = 45usize;
                let fetch = move |skip: usize| {
                    let end = (skip + 20).min(total);
                    let items: Vec<i32> = (skip..end).map(|i| i as i32).collect();
                    let has_more = end < total;
                    async move {
                        Ok::<_, FetchError>(Page {
                            items,
                            has_more,
                            next_skip: end,
                        })
                    }
                };

                let entry = client.arena().get_or_create(&["posts"].into(), std::time::Duration::from_secs(60), std::time::Duration::MAX);
                let handle = InfiniteQueryHandle::new(
                    entry,
                    client.arena().clone(),
                    fetch,
                    0usize,
                    |page: &Page, _pages: &[Page]| if page.has_more { Some(page.next_skip) } else { None },
                    QueryOptions::default(),
                );

                handle.entry.settled.notified().await;
                assert!(handle.has_next_page());
                assert_eq!(handle.data().unwrap().pages.len(), 1);

                handle.fetch_next_page();
                handle.entry.settled.notified().await;
                assert!(handle.has_next_page());
                assert_eq!(handle.data().unwrap().pages.len(), 2);

                handle.fetch_next_page();
                handle.entry.settled.notified().await;
                assert!(!handle.has_next_page());
                assert_eq!(handle.data().unwrap().pages.len(), 3);
                let flat = handle.data().unwrap().flat_map(|p| p.items.clone());
                assert_eq!(flat.len(), 45);
            })
            .await;
    }

    #[tokio::test]
    async fn refetch_rolls_back_on_partial_failure() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let call_count = Rc::new(StdCell::new(0));
                let call_count_clone = Rc::clone(&call_count);
                let fetch = move |skip: usize| {
                    let n = call_count_clone.get();
                    call_count_clone.set(n + 1);
                    async move {
                        if n < 2 {
                            Ok::<_, FetchError>(Page {
                                items: vec![skip as i32],
                                has_more: skip < 20,
                                next_skip: skip + 10,
                            })
                        } else {
                            Err(FetchError::network("down"))
                        }
                    }
                };

                let entry = client.arena().get_or_create(&["paged"].into(), std::time::Duration::from_secs(60), std::time::Duration::MAX);
                let mut options = QueryOptions::default();
                options.retry.max_network_retries = 0;
                let handle = InfiniteQueryHandle::new(
                    entry,
                    client.arena().clone(),
                    fetch,
                    0usize,
                    |page: &Page, _pages: &[Page]| if page.has_more { Some(page.next_skip) } else { None },
                    options,
                );
                handle.entry.settled.notified().await;
                handle.fetch_next_page();
                handle.entry.settled.notified().await;
                let before = handle.data().unwrap();
                assert_eq!(before.pages.len(), 2);

                handle.refetch().await;
                let after = handle.data().unwrap();
                assert_eq!(after.pages.len(), 2, "failed refetch should not drop previously-fetched pages");
                assert!(handle.error().is_some());
            })
            .await;
    }
}
