//! `Cell<T>`, the observable value primitive the rest of the crate is built on.

use std::cell::RefCell;
use std::fmt::{self, Debug};
use std::rc::Rc;

use super::runtime::{with_runtime, Subscriber};

/// An observable value. Reads inside a [`Computed`](super::Computed) or
/// [`effect`](super::effect) register a dependency automatically; writes
/// notify subscribers unless the new value equals the old one.
#[derive(Clone)]
pub struct Cell<T> {
    inner: Rc<CellInner<T>>,
}

struct CellInner<T> {
    value: RefCell<T>,
    subscribers: RefCell<Vec<Subscriber>>,
    version: RefCell<u64>,
}

impl<T> Cell<T> {
    pub fn new(value: T) -> Self {
        Cell {
            inner: Rc::new(CellInner {
                value: RefCell::new(value),
                subscribers: RefCell::new(Vec::new()),
                version: RefCell::new(0),
            }),
        }
    }

    /// Read the current value, tracking this read in the active subscriber (if any).
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.track();
        self.inner.value.borrow().clone()
    }

    /// Read without registering a dependency.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Replace the value. Notifies subscribers unless `value == ` the current value.
    pub fn set(&self, value: T)
    where
        T: PartialEq,
    {
        let changed = *self.inner.value.borrow() != value;
        *self.inner.value.borrow_mut() = value;
        if changed {
            self.notify();
        }
    }

    /// Replace the value unconditionally, even if it compares equal to the
    /// current one. Used by composite cells (map/list) whose mutation
    /// methods always represent a real change.
    pub fn replace(&self, value: T) {
        *self.inner.value.borrow_mut() = value;
        self.notify();
    }

    /// Mutate in place and always notify. Used by composite mutation methods.
    pub fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.inner.value.borrow_mut());
        self.notify();
        result
    }

    /// Mutate in place, notifying only if `changed` returns `true`.
    pub fn update_if(&self, f: impl FnOnce(&mut T) -> bool) {
        let changed = f(&mut self.inner.value.borrow_mut());
        if changed {
            self.notify();
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.track();
        f(&self.inner.value.borrow())
    }

    pub fn with_untracked<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.inner.value.borrow())
    }

    pub fn version(&self) -> u64 {
        *self.inner.version.borrow()
    }

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

    fn notify(&self) {
        *self.inner.version.borrow_mut() += 1;
        let subscribers: Vec<_> = self.inner.subscribers.borrow().clone();
        for subscriber in subscribers {
            subscriber.notify();
        }
    }
}

impl<T: Default> Default for Cell<T> {
    fn default() -> Self {
        Cell::new(T::default())
    }
}

impl<T: Debug> Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("value", &*self.inner.value.borrow())
            .field("version", &self.inner.version.borrow())
            .finish()
    }
}

impl<T> From<T> for Cell<T> {
    fn from(value: T) -> Self {
        Cell::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn set_suppresses_notification_on_equal_value() {
        let cell = Cell::new(1);
        let notifications = Rc::new(StdCell::new(0));
        let notifications_clone = notifications.clone();
        let _effect = super::super::effect(move || {
            cell.get();
            notifications_clone.set(notifications_clone.get() + 1);
        });
        assert_eq!(notifications.get(), 1);
    }

    #[test]
    fn update_if_respects_changed_flag() {
        let cell = Cell::new(vec![1, 2]);
        let notifications = Rc::new(StdCell::new(0));
        let notifications_clone = notifications.clone();
        let cell_clone = cell.clone();
        let _effect = super::super::effect(move || {
            cell_clone.get();
            notifications_clone.set(notifications_clone.get() + 1);
        });
        cell.update_if(|v| {
            v.push(3);
            true
        });
        assert_eq!(notifications.get(), 2);
    }
}
