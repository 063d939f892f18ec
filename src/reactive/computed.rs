//! `Computed<T>`, a lazily-recomputed derived cell with a sticky error state.

use std::cell::{Cell as StdCell, RefCell};
use std::fmt;
use std::rc::Rc;

use super::runtime::{with_runtime, Subscriber};

/// Error raised by a computed's compute function. Stored as a sticky state:
/// once a computation fails, readers observe the error until the next
/// dependency change triggers a fresh (possibly successful) recompute.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeError(pub String);

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ComputeError {}

/// A value derived from other cells/computeds. Recomputes only when a
/// dependency it read last time has changed.
pub struct Computed<T> {
    inner: Rc<ComputedInner<T>>,
}

struct ComputedInner<T> {
    compute: Box<dyn Fn() -> Result<T, ComputeError>>,
    value: RefCell<Option<Result<T, ComputeError>>>,
    dirty: StdCell<bool>,
    subscriber: RefCell<Option<Subscriber>>,
    /// Readers of this computed (another computed's or an effect's
    /// subscriber), notified from `recompute()` when the recomputed value
    /// differs from the one they last observed. Mirrors
    /// `Cell`'s own `subscribers` list (`cell.rs`'s `track`/`notify`).
    subscribers: RefCell<Vec<Subscriber>>,
}

impl<T: Clone + PartialEq + 'static> Computed<T> {
    pub fn new(compute: impl Fn() -> T + 'static) -> Self {
        Self::try_new(move || Ok(compute()))
    }

    /// Like [`new`](Self::new), but the compute function can fail; the
    /// failure becomes a sticky error observable by readers.
    pub fn try_new(compute: impl Fn() -> Result<T, ComputeError> + 'static) -> Self {
        let inner = Rc::new(ComputedInner {
            compute: Box::new(compute),
            value: RefCell::new(None),
            dirty: StdCell::new(true),
            subscriber: RefCell::new(None),
            subscribers: RefCell::new(Vec::new()),
        });

        let inner_weak = Rc::downgrade(&inner);
        let id = with_runtime(|rt| rt.next_id());
        let subscriber = Subscriber::new(id, move || {
            if let Some(inner) = inner_weak.upgrade() {
                inner.dirty.set(true);
            }
        });
        *inner.subscriber.borrow_mut() = Some(subscriber);

        Computed { inner }
    }

    /// Current value, recomputing first if a dependency changed. Panics if
    /// the compute function errored; prefer [`try_get`](Self::try_get) when
    /// the compute function is fallible.
    pub fn get(&self) -> T {
        self.try_get().expect("computed is in a sticky error state")
    }

    pub fn try_get(&self) -> Result<T, ComputeError> {
        self.track();
        if self.inner.dirty.get() || self.inner.value.borrow().is_none() {
            self.recompute();
        }
        self.inner.value.borrow().clone().unwrap()
    }

    /// Register the currently active subscriber (an effect, or another
    /// computed reading this one from inside its own compute function) as a
    /// dependent, the same way `Cell::track` does. Without this, nothing
    /// downstream of a `Computed` is ever notified when it recomputes.
    fn track(&self) {
        with_runtime(|rt| {
            let subscriber = rt.current_subscriber();
            if let Some(subscriber) = &subscriber {
                let mut subs = self.inner.subscribers.borrow_mut();
                if !subs.iter().any(|s| s.id == subscriber.id) {
                    subs.push(subscriber.clone());
                }
            }
            if let (Some(subscriber), Some(sink)) = (subscriber, rt.current_tracking_sink()) {
                let inner = Rc::clone(&self.inner);
                let id = subscriber.id;
                sink.borrow_mut().push(Box::new(move || {
                    inner.subscribers.borrow_mut().retain(|s| s.id != id);
                }));
            }
        });
    }

    fn notify_subscribers(&self) {
        let subscribers: Vec<_> = self.inner.subscribers.borrow().clone();
        for subscriber in subscribers {
            subscriber.notify();
        }
    }

    fn recompute(&self) {
        let subscriber = self.inner.subscriber.borrow().clone();
        if let Some(sub) = subscriber {
            with_runtime(|rt| rt.push_subscriber(sub));
        }

        let value = (self.inner.compute)();

        with_runtime(|rt| {
            rt.pop_subscriber();
        });

        // The very first computation (no previous value to compare against)
        // is never a "change" a subscriber needs telling about: whoever
        // triggered it is mid-call to `get`/`try_get` and already receives
        // the freshly computed value as that call's return value. Treating
        // it as a change would re-invoke a subscriber (e.g. an `effect`)
        // while it is still in the middle of its own first run.
        let changed = match (&*self.inner.value.borrow(), &value) {
            (None, _) => false,
            (Some(Ok(old)), Ok(new)) => old != new,
            (Some(Err(old)), Err(new)) => old != new,
            _ => true,
        };

        *self.inner.value.borrow_mut() = Some(value);
        self.inner.dirty.set(false);

        if changed {
            self.notify_subscribers();
        }
    }
}

impl<T: Clone + 'static> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Computed {
            inner: Rc::clone(&self.inner),
        }
    }
}
