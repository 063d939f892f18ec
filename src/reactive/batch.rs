//! Batched writes and untracked reads.

use super::runtime::with_runtime;

/// Run `f`, coalescing any cell notifications triggered inside it so each
/// subscriber is notified at most once, after `f` returns.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    with_runtime(|rt| rt.start_batch());
    let result = f();
    let pending = with_runtime(|rt| rt.end_batch());
    for subscriber in pending {
        subscriber.notify();
    }
    result
}

/// Run `f` without registering any cell reads inside it as dependencies of
/// the enclosing computed/effect.
pub fn untrack<R>(f: impl FnOnce() -> R) -> R {
    let subscriber = with_runtime(|rt| rt.pop_subscriber());
    let result = f();
    if let Some(sub) = subscriber {
        with_runtime(|rt| rt.push_subscriber(sub));
    }
    result
}
