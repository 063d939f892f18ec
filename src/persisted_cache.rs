//! The optional persisted query cache layout: a JSON snapshot of cache
//! entries under one root storage key, debounced and throttled on write,
//! filtered by `cache_duration` on load.
//!
//! The arena's entries are type-erased (`Rc<dyn Any>`), so this module
//! cannot serialize an arbitrary entry without knowing its concrete `V`.
//! Rather than add a `V: Serialize` bound to every [`Client::query`] call
//! site, persistence here is opt-in per key: the caller marks a key
//! persistent with [`PersistedQueryCache::mark_dirty`] (typically from a
//! query's success hook) and rehydrates it explicitly with
//! [`Client::rehydrate_query_data`] after [`Client::init`]. This keeps the
//! arena generic while still delivering the on-disk format and
//! debounce/throttle discipline described above.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::query_key::QueryKey;
use crate::storage::Storage;

/// Root storage key the whole snapshot lives under.
pub const QUERY_CACHE_STORAGE_KEY: &str = "__query_cache__";

const DEBOUNCE: Duration = Duration::from_millis(500);
const THROTTLE: Duration = Duration::from_secs(1);

/// One entry's on-disk representation: `{fingerprint -> {key, data,
/// updated_at, stale_duration, cache_duration}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEntrySnapshot {
    pub key_tokens: Vec<serde_json::Value>,
    pub data: serde_json::Value,
    pub updated_at_millis: u64,
    pub stale_duration_millis: u64,
    pub cache_duration_millis: u64,
}

impl PersistedEntrySnapshot {
    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.key_tokens.clone())
    }

    pub fn stale_duration(&self) -> Duration {
        Duration::from_millis(self.stale_duration_millis)
    }

    pub fn cache_duration(&self) -> Duration {
        if self.cache_duration_millis == u64::MAX {
            Duration::MAX
        } else {
            Duration::from_millis(self.cache_duration_millis)
        }
    }

    fn is_expired(&self, now_millis: u64) -> bool {
        if self.cache_duration_millis == u64::MAX {
            return false;
        }
        now_millis.saturating_sub(self.updated_at_millis) >= self.cache_duration_millis
    }
}

fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Read `__query_cache__` and drop any entry whose `cache_duration` has
/// elapsed since `updated_at`.
pub async fn load_cache_snapshot(storage: &dyn Storage) -> HashMap<String, PersistedEntrySnapshot> {
    let raw = match storage.get(QUERY_CACHE_STORAGE_KEY).await {
        Ok(Some(raw)) => raw,
        Ok(None) => return HashMap::new(),
        Err(e) => {
            warn!(error = %e, "failed to read persisted query cache, starting empty");
            return HashMap::new();
        }
    };

    let parsed: HashMap<String, PersistedEntrySnapshot> = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(error = %e, "persisted query cache is corrupt, starting empty");
            return HashMap::new();
        }
    };

    let now = now_millis();
    let (kept, dropped): (Vec<_>, Vec<_>) = parsed.into_iter().partition(|(_, snap)| !snap.is_expired(now));
    debug!(kept = kept.len(), dropped = dropped.len(), "loaded persisted query cache");
    kept.into_iter().collect()
}

/// Owns the debounced/throttled write-back loop for the persisted query
/// cache: writes wait at least [`DEBOUNCE`] after the last mutation and
/// are throttled to no more than one per [`THROTTLE`] window. Construct
/// one per [`Client`](crate::client::Client) that opts into persistence.
pub struct PersistedQueryCache {
    storage: Rc<dyn Storage>,
    snapshot: Rc<RefCell<HashMap<String, PersistedEntrySnapshot>>>,
    last_write: Rc<RefCell<Option<Instant>>>,
    write_scheduled: Rc<RefCell<bool>>,
}

impl PersistedQueryCache {
    pub fn new(storage: Rc<dyn Storage>, initial: HashMap<String, PersistedEntrySnapshot>) -> Self {
        PersistedQueryCache {
            storage,
            snapshot: Rc::new(RefCell::new(initial)),
            last_write: Rc::new(RefCell::new(None)),
            write_scheduled: Rc::new(RefCell::new(false)),
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<PersistedEntrySnapshot> {
        self.snapshot.borrow().get(fingerprint).cloned()
    }

    /// Mark `fingerprint` dirty with a freshly-serialized snapshot, and
    /// schedule a debounced/throttled write-back.
    pub fn mark_dirty(&self, fingerprint: String, entry: PersistedEntrySnapshot) {
        self.snapshot.borrow_mut().insert(fingerprint, entry);
        self.schedule_write();
    }

    pub fn remove(&self, fingerprint: &str) {
        self.snapshot.borrow_mut().remove(fingerprint);
        self.schedule_write();
    }

    fn schedule_write(&self) {
        if *self.write_scheduled.borrow() {
            return;
        }
        *self.write_scheduled.borrow_mut() = true;

        let storage = Rc::clone(&self.storage);
        let snapshot = Rc::clone(&self.snapshot);
        let last_write = Rc::clone(&self.last_write);
        let write_scheduled = Rc::clone(&self.write_scheduled);

        tokio::task::spawn_local(async move {
            tokio::time::sleep(DEBOUNCE).await;

            let wait = {
                let last = last_write.borrow();
                match *last {
                    Some(at) if at.elapsed() < THROTTLE => Some(THROTTLE - at.elapsed()),
                    _ => None,
                }
            };
            if let Some(wait) = wait {
                tokio::time::sleep(wait).await;
            }

            let encoded = {
                let snap = snapshot.borrow();
                serde_json::to_string(&*snap).unwrap_or_default()
            };
            if let Err(e) = storage.set(QUERY_CACHE_STORAGE_KEY, &encoded).await {
                warn!(error = %e, "failed to write persisted query cache");
            }
            *last_write.borrow_mut() = Some(Instant::now());
            *write_scheduled.borrow_mut() = false;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    fn snapshot(updated_at_millis: u64, cache_duration_millis: u64) -> PersistedEntrySnapshot {
        PersistedEntrySnapshot {
            key_tokens: vec![json!("posts")],
            data: json!({"id": 1}),
            updated_at_millis,
            stale_duration_millis: 60_000,
            cache_duration_millis,
        }
    }

    #[test]
    fn expired_entries_are_dropped_on_load() {
        let now = now_millis();
        let fresh = snapshot(now, 60_000);
        let stale = snapshot(now.saturating_sub(120_000), 60_000);
        assert!(!fresh.is_expired(now));
        assert!(stale.is_expired(now));
    }

    #[test]
    fn infinite_cache_duration_never_expires() {
        let ancient = snapshot(0, u64::MAX);
        assert!(!ancient.is_expired(now_millis()));
    }

    #[tokio::test]
    async fn write_then_load_roundtrips() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let storage: Rc<dyn Storage> = Rc::new(MemoryStorage::new());
                let cache = PersistedQueryCache::new(Rc::clone(&storage), HashMap::new());
                cache.mark_dirty("fp1".to_string(), snapshot(now_millis(), 60_000));
                tokio::time::sleep(Duration::from_millis(600)).await;

                let loaded = load_cache_snapshot(storage.as_ref()).await;
                assert!(loaded.contains_key("fp1"));
            })
            .await;
    }
}
