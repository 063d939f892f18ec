//! The fetch lifecycle state machine: dedup, cancellation, retry with
//! backoff, and timeout, as a free function operating on the arena's
//! type-erased [`Entry`]. Dedup is a single in-flight slot per entry
//! (`Entry::generation` + `Entry::cancel`), since every observer of a key
//! shares one entry.

use std::any::Any;
use std::future::Future;
use std::rc::Rc;
use std::time::Instant;

use futures::future::{select, Either};
use futures_channel::oneshot;

use crate::entry::{Entry, EntryStatus};
use crate::error::{classify, FetchError, QueryError, QueryErrorKind};
use crate::query_options::{LogLevel, QueryOptions};

fn status_for_kind(kind: QueryErrorKind) -> EntryStatus {
    match kind {
        QueryErrorKind::Timeout => EntryStatus::Timeout,
        QueryErrorKind::Network => EntryStatus::NetworkError,
        _ => EntryStatus::Error,
    }
}

/// Run one fetch "execution" against `entry`: bumps the generation counter
/// (superseding and cancelling whatever was previously in flight), races
/// the caller's fetcher against cancellation and the per-attempt timeout,
/// retries according to `options.retry`, and writes the settled result
/// back to `entry` only if nothing has superseded this attempt meanwhile.
///
/// `fetcher` is called once per attempt; the caller typically closes over
/// whatever state the fetch needs so each call is cheap to repeat.
pub(crate) async fn execute_fetch<V, F, Fut>(entry: Rc<Entry>, fetcher: F, options: QueryOptions)
where
    V: 'static,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<V, FetchError>>,
{
    let log_level = options.log_level.unwrap_or(LogLevel::Warn);

    // Dedup: at most one in-flight fetch per entry. A second caller joins
    // the one already running rather than starting its own attempt.
    if entry.is_fetching.get_untracked() {
        if log_level.allows(LogLevel::Verbose) {
            tracing::trace!(key = ?entry.key.tokens(), fingerprint = %entry.fingerprint, "joining in-flight fetch");
        }
        entry.settled.notified().await;
        return;
    }

    let generation = entry.bump_generation();
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    *entry.cancel.borrow_mut() = Some(cancel_tx);

    if entry.data.get_untracked().is_none() {
        entry.status.set(EntryStatus::Loading);
    }
    entry.is_fetching.set(true);

    if log_level.allows(LogLevel::Debug) {
        tracing::debug!(key = ?entry.key.tokens(), fingerprint = %entry.fingerprint, generation, "fetch started");
    }

    let request_timeout = options
        .request_timeout
        .unwrap_or(crate::query_options::DEFAULT_REQUEST_TIMEOUT);

    let mut attempt = 0u32;
    let outcome: Result<V, QueryError> = loop {
        let attempt_fut = Box::pin(run_attempt(&fetcher, request_timeout));
        let attempt_result = match select(attempt_fut, &mut cancel_rx).await {
            Either::Left((result, _)) => result,
            Either::Right(_) => break Err(QueryError::cancelled()),
        };

        match attempt_result {
            Ok(value) => break Ok(value),
            Err(fetch_err) => {
                let kind = classify(&fetch_err);
                if options.retry.should_retry(kind, attempt) {
                    let delay = options.retry.backoff(attempt, jitter_sample());
                    if log_level.allows(LogLevel::Debug) {
                        tracing::debug!(
                            key = ?entry.key.tokens(),
                            attempt,
                            ?kind,
                            ?delay,
                            "retrying fetch after error"
                        );
                    }
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                    continue;
                }
                break Err(QueryError::new(kind, fetch_err.message));
            }
        }
    };

    // A newer attempt (or an explicit set_query_data / removal) may have
    // superseded this one while it was in flight; drop the stale result.
    if entry.generation.get() != generation {
        return;
    }

    entry.is_fetching.set(false);
    entry.cancel.borrow_mut().take();

    match outcome {
        Ok(value) => {
            if log_level.allows(LogLevel::Debug) {
                tracing::debug!(key = ?entry.key.tokens(), fingerprint = %entry.fingerprint, "fetch settled: success");
            }
            entry.data.replace(Some(Rc::new(value) as Rc<dyn Any>));
            entry.error.replace(None);
            entry.status.set(EntryStatus::Success);
            entry.updated_at.replace(Some(Instant::now()));
        }
        Err(err) => {
            let kind = err.kind;
            if log_level.allows(LogLevel::Debug) {
                tracing::debug!(key = ?entry.key.tokens(), fingerprint = %entry.fingerprint, ?kind, "fetch settled: error");
            }
            entry.status.set(status_for_kind(kind));
            entry.error.replace(Some(err));
            entry.errored_at.replace(Some(Instant::now()));
        }
    }

    entry.settled.notify_waiters();
}

async fn run_attempt<F, Fut, V>(fetcher: &F, request_timeout: std::time::Duration) -> Result<V, FetchError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<V, FetchError>>,
{
    match tokio::time::timeout(request_timeout, fetcher()).await {
        Ok(result) => result,
        Err(_) => {
            let mut err = FetchError::network(format!("request exceeded timeout of {request_timeout:?}"));
            err.is_timeout = true;
            Err(err)
        }
    }
}

/// A `[0,1)` sample used to jitter retry backoff. Not cryptographic, just
/// enough to avoid synchronized retry storms across entries.
fn jitter_sample() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}

/// Cancel whatever fetch is currently in flight for `entry`, if any,
/// without starting a replacement.
pub(crate) fn cancel_in_flight(entry: &Entry) {
    entry.bump_generation();
    entry.is_fetching.set(false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key::QueryKey;
    use std::cell::Cell as StdCell;
    use std::time::Duration;

    fn make_entry() -> Rc<Entry> {
        Rc::new(Entry::new(
            QueryKey::from("k"),
            "k".to_string(),
            Duration::from_secs(60),
            Duration::MAX,
        ))
    }

    #[tokio::test]
    async fn successful_fetch_populates_data() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let entry = make_entry();
                execute_fetch(
                    Rc::clone(&entry),
                    || async { Ok::<_, FetchError>(42i32) },
                    QueryOptions::default(),
                )
                .await;
                assert_eq!(entry.status.get_untracked(), EntryStatus::Success);
                assert_eq!(*entry.downcast_data::<i32>().unwrap(), 42);
                assert!(!entry.is_fetching.get_untracked());
            })
            .await;
    }

    #[tokio::test]
    async fn non_retryable_error_settles_immediately() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let entry = make_entry();
                let calls = Rc::new(StdCell::new(0));
                let calls_inner = Rc::clone(&calls);
                execute_fetch(
                    Rc::clone(&entry),
                    move || {
                        calls_inner.set(calls_inner.get() + 1);
                        async { Err::<i32, _>(FetchError::parsing("bad body")) }
                    },
                    QueryOptions::default(),
                )
                .await;
                assert_eq!(calls.get(), 1);
                assert_eq!(entry.status.get_untracked(), EntryStatus::Error);
                assert!(entry.error.get_untracked().is_some());
            })
            .await;
    }

    #[tokio::test]
    async fn retryable_server_error_retries_then_succeeds() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let entry = make_entry();
                let calls = Rc::new(StdCell::new(0));
                let calls_inner = Rc::clone(&calls);
                let mut options = QueryOptions::default();
                options.retry.base_delay = Duration::from_millis(1);
                execute_fetch(
                    Rc::clone(&entry),
                    move || {
                        let n = calls_inner.get();
                        calls_inner.set(n + 1);
                        async move {
                            if n == 0 {
                                Err(FetchError::server(503, "unavailable"))
                            } else {
                                Ok(99i32)
                            }
                        }
                    },
                    options,
                )
                .await;
                assert_eq!(calls.get(), 2);
                assert_eq!(entry.status.get_untracked(), EntryStatus::Success);
                assert_eq!(*entry.downcast_data::<i32>().unwrap(), 99);
            })
            .await;
    }

    #[tokio::test]
    async fn concurrent_execute_fetch_calls_dedup_to_one_fetcher_invocation() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let entry = make_entry();
                let calls = Rc::new(StdCell::new(0));

                let calls_a = Rc::clone(&calls);
                let fetcher_a = move || {
                    calls_a.set(calls_a.get() + 1);
                    async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, FetchError>(1i32)
                    }
                };
                let calls_b = Rc::clone(&calls);
                let fetcher_b = move || {
                    calls_b.set(calls_b.get() + 1);
                    async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, FetchError>(1i32)
                    }
                };

                let entry_a = Rc::clone(&entry);
                let entry_b = Rc::clone(&entry);
                let first = tokio::task::spawn_local(execute_fetch(entry_a, fetcher_a, QueryOptions::default()));
                let second = tokio::task::spawn_local(execute_fetch(entry_b, fetcher_b, QueryOptions::default()));
                let _ = futures::future::join(first, second).await;

                assert_eq!(calls.get(), 1, "overlapping fetches for the same entry should invoke the fetcher once");
                assert_eq!(*entry.downcast_data::<i32>().unwrap(), 1);
            })
            .await;
    }

    #[tokio::test]
    async fn superseded_attempt_does_not_clobber_newer_generation() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let entry = make_entry();
                let entry_for_fetch = Rc::clone(&entry);
                let handle = tokio::task::spawn_local(execute_fetch(
                    entry_for_fetch,
                    || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok::<_, FetchError>(1i32)
                    },
                    QueryOptions::default(),
                ));

                // Let the fetch start, then supersede it while it's still
                // sleeping: a later write must win over the late fetch result.
                tokio::time::sleep(Duration::from_millis(10)).await;
                entry.bump_generation();
                entry.data.replace(Some(Rc::new(2i32) as Rc<dyn Any>));
                entry.error.replace(None);
                entry.status.set(EntryStatus::Success);

                handle.await.unwrap();

                assert_eq!(
                    *entry.downcast_data::<i32>().unwrap(),
                    2,
                    "a fetch that resolves after being superseded must not clobber the newer write"
                );
            })
            .await;
    }
}
