#![forbid(unsafe_code)]

//! # query_store
//!
//! A reactive data layer for single-threaded async Rust applications,
//! combining a request-deduplicating, staleness-aware query cache and
//! mutation engine (in the shape of [TanStack Query](https://tanstack.com/query/latest))
//! with a set of persisted reactive cells backed by a pluggable storage
//! interface. Both halves share one reactive substrate: [`Cell`],
//! [`Computed`], [`batch`] and [`effect`].
//!
//! Everything here is `!Send` by design: state lives behind `Rc`/`RefCell`
//! and is driven from a single [`tokio::task::LocalSet`], the same way a UI
//! framework's reactive graph runs pinned to one thread.
//!
//! ## Query cache
//!
//! ```no_run
//! use query_store::{Client, ClientConfig, QueryOptions, FetchError};
//!
//! # async fn run() {
//! let client = Client::new(ClientConfig::default());
//! let handle = client.query(
//!     ["posts", "1"],
//!     || async { Ok::<_, FetchError>("hello".to_string()) },
//!     QueryOptions::default(),
//! );
//! handle.wait_for_hydration().await;
//! assert!(handle.is_success());
//! # }
//! ```
//!
//! ## Persisted cells
//!
//! ```no_run
//! use std::rc::Rc;
//! use query_store::{CellRegistry, MemoryStorage, Storage};
//!
//! # async fn run() {
//! let storage: Rc<dyn Storage> = Rc::new(MemoryStorage::new());
//! let registry = CellRegistry::new(storage);
//! let count: query_store::PersistedCell<i64> = registry.scalar("count", "count", 0);
//! count.wait_for_hydration().await;
//! count.set(count.get() + 1);
//! # }
//! ```

mod client;
mod entry;
mod error;
mod garbage_collector;
mod handle;
mod infinite_query;
mod mutation;
mod persisted;
mod persisted_cache;
mod query;
mod query_key;
mod query_options;
mod reactive;
mod storage;

pub use client::Client;
pub use error::{classify, FetchError, QueryError, QueryErrorKind, RetryPolicy};
pub use handle::QueryHandle;
pub use infinite_query::{InfiniteData, InfiniteQueryHandle};
pub use mutation::{MutationHandle, MutationStatus};
pub use persisted::{CellRegistry, PersistedList, PersistedMap, PersistedCell};
pub use persisted_cache::{PersistedEntrySnapshot, PersistedQueryCache, QUERY_CACHE_STORAGE_KEY};
pub use query_key::QueryKey;
pub use query_options::{ClientConfig, LogLevel, QueryOptions};
pub use reactive::{batch, effect, untrack, Cell, ComputeError, Computed, DisposeHandle};
pub use storage::{FileStorage, Kv, MemoryStorage, RecordStore, Storage, StorageError, StorageResult};

/// Lifecycle status shared by query and infinite-query handles,
/// re-exported for matching against
/// [`QueryHandle::status`](crate::handle::QueryHandle::status) and
/// [`InfiniteQueryHandle::status`](crate::infinite_query::InfiniteQueryHandle::status).
pub use entry::EntryStatus as QueryStatus;
