//! Pluggable storage interface: a simple key/value contract plus a
//! record-oriented store for collections with granular per-item updates.
//!
//! The core never assumes ordering beyond last-writer-wins; implementations
//! may be in-memory ([`memory::MemoryStorage`]), file-backed
//! ([`file::FileStorage`]), or platform-native.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use async_trait::async_trait;
use thiserror::Error;

/// A single error kind for every storage failure, so callers never need to
/// match on backend-specific variants.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(String),
    #[error("storage serialization error: {0}")]
    Serialization(String),
    #[error("storage backend not initialized")]
    NotInitialized,
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Simple key/value capability.
#[async_trait(?Send)]
pub trait Kv {
    async fn init(&self) -> StorageResult<()>;
    async fn get(&self, key: &str) -> StorageResult<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;
    async fn delete(&self, key: &str) -> StorageResult<()>;
    async fn clear(&self) -> StorageResult<()>;
    /// All keys currently stored with the given prefix. Used by prefix
    /// invalidation and by the persisted query cache layout.
    async fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Record-oriented capability for collections that want granular,
/// per-item writes instead of rewriting a whole JSON blob per mutation.
#[async_trait(?Send)]
pub trait RecordStore {
    async fn set_record(&self, store: &str, id: &str, value: &str) -> StorageResult<()>;
    async fn get_record(&self, store: &str, id: &str) -> StorageResult<Option<String>>;
    async fn delete_record(&self, store: &str, id: &str) -> StorageResult<()>;
    async fn get_records(&self, store: &str) -> StorageResult<Vec<(String, String)>>;
    async fn set_records(&self, store: &str, records: Vec<(String, String)>) -> StorageResult<()>;
    async fn delete_records(&self, store: &str, ids: &[String]) -> StorageResult<()>;
    async fn clear_store(&self, store: &str) -> StorageResult<()>;
}

/// A storage backend implements both capability sets.
pub trait Storage: Kv + RecordStore {}
impl<T: Kv + RecordStore> Storage for T {}
