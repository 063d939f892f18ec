//! `MutationHandle<V, A>`, the write-side counterpart to [`QueryHandle`].
//!
//! A mutation tracks `idle → loading → {success|error}` on its own
//! reactive cells (not tied to any cache entry), runs `on_success`/
//! `on_error`/`on_settled` hooks around the call, and can invalidate
//! query keys on success.

use std::future::Future;
use std::rc::Rc;
use std::time::Instant;

use crate::client::Client;
use crate::error::{classify, FetchError, QueryError};
use crate::query_key::QueryKey;
use crate::reactive::Cell;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
    Idle,
    Loading,
    Success,
    Error,
}

type MutateFn<V, A> = Rc<dyn Fn(A) -> std::pin::Pin<Box<dyn Future<Output = Result<V, FetchError>>>>>;
type SuccessHook<V, A> = Rc<dyn Fn(&V, &A)>;
type ErrorHook<A> = Rc<dyn Fn(&QueryError, &A)>;
type SettledHook<V, A> = Rc<dyn Fn(Option<&V>, Option<&QueryError>, &A)>;

/// A mutation is not tied to a cache entry; it runs its function, tracks
/// `idle → loading → {success|error}` on its own reactive cells, and
/// optionally invalidates query keys on success.
pub struct MutationHandle<V, A> {
    client: Client,
    mutate_fn: MutateFn<V, A>,
    status: Cell<MutationStatus>,
    data: Cell<Option<Rc<V>>>,
    error: Cell<Option<QueryError>>,
    submitted_at: Cell<Option<Instant>>,
    invalidates: std::cell::RefCell<Vec<QueryKey>>,
    on_success: Option<SuccessHook<V, A>>,
    on_error: Option<ErrorHook<A>>,
    on_settled: Option<SettledHook<V, A>>,
}

impl<V, A> MutationHandle<V, A>
where
    V: 'static,
    A: Clone + 'static,
{
    pub(crate) fn new<F, Fut>(client: Client, mutate_fn: Rc<F>) -> Self
    where
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = Result<V, FetchError>> + 'static,
    {
        let boxed: MutateFn<V, A> = Rc::new(move |args| Box::pin((mutate_fn)(args)) as std::pin::Pin<Box<dyn Future<Output = _>>>);
        MutationHandle {
            client,
            mutate_fn: boxed,
            status: Cell::new(MutationStatus::Idle),
            data: Cell::new(None),
            error: Cell::new(None),
            submitted_at: Cell::new(None),
            invalidates: std::cell::RefCell::new(Vec::new()),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Query key prefixes to invalidate once the mutation succeeds (spec
    /// §4.F "on success, invalidate configured keys").
    pub fn invalidates(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        *self.invalidates.borrow_mut() = keys.into_iter().collect();
        self
    }

    pub fn on_success(mut self, f: impl Fn(&V, &A) + 'static) -> Self {
        self.on_success = Some(Rc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&QueryError, &A) + 'static) -> Self {
        self.on_error = Some(Rc::new(f));
        self
    }

    pub fn on_settled(mut self, f: impl Fn(Option<&V>, Option<&QueryError>, &A) + 'static) -> Self {
        self.on_settled = Some(Rc::new(f));
        self
    }

    pub fn status(&self) -> MutationStatus {
        self.status.get()
    }

    pub fn data(&self) -> Option<Rc<V>> {
        self.data.get()
    }

    pub fn error(&self) -> Option<QueryError> {
        self.error.get()
    }

    pub fn is_idle(&self) -> bool {
        self.status() == MutationStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status() == MutationStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status() == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status() == MutationStatus::Error
    }

    /// Run the mutation and report its result, without mutating any
    /// reactive state on this handle beyond what `mutate` also does.
    pub async fn mutate_async(&self, args: A) -> Result<Rc<V>, QueryError> {
        self.status.set(MutationStatus::Loading);
        self.submitted_at.replace(Some(Instant::now()));
        self.error.replace(None);

        let result = (self.mutate_fn)(args.clone()).await;

        match result {
            Ok(value) => {
                let value = Rc::new(value);
                self.data.replace(Some(Rc::clone(&value)));
                self.status.set(MutationStatus::Success);
                for key in self.invalidates.borrow().iter() {
                    self.client.invalidate_queries(key);
                }
                if let Some(hook) = &self.on_success {
                    hook(&value, &args);
                }
                if let Some(hook) = &self.on_settled {
                    hook(Some(&value), None, &args);
                }
                Ok(value)
            }
            Err(fetch_err) => {
                let kind = classify(&fetch_err);
                let err = QueryError::new(kind, fetch_err.message);
                self.error.replace(Some(err.clone()));
                self.status.set(MutationStatus::Error);
                if let Some(hook) = &self.on_error {
                    hook(&err, &args);
                }
                if let Some(hook) = &self.on_settled {
                    hook(None, Some(&err), &args);
                }
                Err(err)
            }
        }
    }

    /// Fire-and-forget variant for UI event handlers that cannot await.
    pub fn mutate(self: &Rc<Self>, args: A)
    where
        V: 'static,
        A: 'static,
    {
        let this = Rc::clone(self);
        tokio::task::spawn_local(async move {
            let _ = this.mutate_async(args).await;
        });
    }

    pub fn reset(&self) {
        self.status.set(MutationStatus::Idle);
        self.data.replace(None);
        self.error.replace(None);
        self.submitted_at.replace(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_options::ClientConfig;

    #[tokio::test]
    async fn successful_mutation_invalidates_and_calls_hooks() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let key: QueryKey = ["posts"].into();
                client.set_query_data(key.clone(), vec![1, 2, 3]);

                let called = Rc::new(std::cell::Cell::new(false));
                let called_clone = Rc::clone(&called);

                let mutation = client
                    .mutation(|title: String| async move { Ok::<_, FetchError>(title) })
                    .invalidates([key.clone()])
                    .on_success(move |_data, _args| called_clone.set(true));

                let result = mutation.mutate_async("hello".to_string()).await;
                assert!(result.is_ok());
                assert!(called.get());
                assert!(mutation.is_success());

                let entry = client.arena().get(&key.fingerprint()).unwrap();
                assert!(entry.is_stale(Instant::now()));
            })
            .await;
    }

    #[tokio::test]
    async fn failed_mutation_reports_error() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = Client::new(ClientConfig::default());
                let mutation = client.mutation(|_: ()| async { Err::<i32, _>(FetchError::server(500, "boom")) });
                let result = mutation.mutate_async(()).await;
                assert!(result.is_err());
                assert!(mutation.is_error());
            })
            .await;
    }
}
