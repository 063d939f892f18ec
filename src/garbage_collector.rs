//! Per-entry GC timer. At most one timer per entry; rescheduling always
//! cancels the prior one first. The merge policy for a declared
//! `cache_duration` is "keep the maximum observed value across
//! observers," applied to the arena's type-erased [`Entry`].

use std::rc::Rc;
use std::time::Duration;

use tracing::debug;

use crate::entry::{Arena, Entry};

/// Schedule eviction of `entry` after its `cache_duration`, unless it
/// already has subscribers or its `cache_duration` is effectively
/// infinite. Cancels any timer already scheduled for this entry first.
pub(crate) fn schedule_gc(entry: Rc<Entry>, arena: Arena) {
    cancel_gc(&entry);

    if entry.subscriber_count.get() > 0 {
        return;
    }

    let cache_duration = entry.cache_duration.get();
    if cache_duration == Duration::MAX {
        return;
    }

    let fingerprint = entry.fingerprint.clone();
    let entry_for_task = Rc::clone(&entry);
    let handle = tokio::task::spawn_local(async move {
        tokio::time::sleep(cache_duration).await;
        if entry_for_task.subscriber_count.get() == 0 {
            arena.remove(&fingerprint);
            debug!(key = %fingerprint, "garbage collected cache entry");
        }
    });
    *entry.gc_timer.borrow_mut() = Some(handle);
}

/// Cancel a pending GC timer, if any (a new subscriber arrived first).
pub(crate) fn cancel_gc(entry: &Entry) {
    if let Some(handle) = entry.gc_timer.borrow_mut().take() {
        handle.abort();
    }
}

/// Merge a newly-declared `cache_duration` into the entry: keep the
/// maximum across every observer that has declared one; an observer that
/// declares `None` (no cache time) widens the entry to effectively
/// infinite.
pub(crate) fn update_cache_duration(entry: &Entry, declared: Option<Duration>) {
    match declared {
        None => entry.cache_duration.set(Duration::MAX),
        Some(duration) => {
            let current = entry.cache_duration.get();
            if duration > current {
                entry.cache_duration.set(duration);
            }
        }
    }
}
