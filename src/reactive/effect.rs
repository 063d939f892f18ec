//! `effect(fn)`, a reactive side effect with an explicit dispose handle.

use std::cell::RefCell;
use std::rc::Rc;

use super::runtime::{with_runtime, Subscriber};

struct EffectInner {
    run: RefCell<Box<dyn Fn()>>,
    subscriber: RefCell<Option<Subscriber>>,
    tracked: RefCell<Vec<Box<dyn FnMut()>>>,
    disposed: RefCell<bool>,
}

impl EffectInner {
    fn execute(&self) {
        if *self.disposed.borrow() {
            return;
        }

        // Drop the previous run's dependency edges before re-tracking; a
        // re-run always re-establishes every edge it still reads.
        for mut disposer in self.tracked.borrow_mut().drain(..) {
            disposer();
        }

        let sink = Rc::new(RefCell::new(Vec::new()));
        let subscriber = self.subscriber.borrow().clone();
        if let Some(sub) = subscriber {
            with_runtime(|rt| rt.push_subscriber(sub));
        }
        with_runtime(|rt| rt.push_tracking_sink(Rc::clone(&sink)));

        (self.run.borrow())();

        with_runtime(|rt| {
            rt.pop_tracking_sink();
            rt.pop_subscriber();
        });

        *self.tracked.borrow_mut() = Rc::try_unwrap(sink)
            .map(RefCell::into_inner)
            .unwrap_or_default();
    }

    fn dispose(&self) {
        *self.disposed.borrow_mut() = true;
        for mut disposer in self.tracked.borrow_mut().drain(..) {
            disposer();
        }
    }
}

/// Handle returned by [`effect`]. Dropping it does not dispose the effect
/// (the effect lives as long as the cells it reads keep a reference to its
/// subscriber); call [`dispose`](Self::dispose) explicitly to tear it down.
pub struct DisposeHandle {
    inner: Rc<EffectInner>,
}

impl DisposeHandle {
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

/// Run `f` immediately, then re-run it whenever a cell it read changes.
/// Returns a handle that unsubscribes the effect from every cell it last
/// read when disposed.
pub fn effect(f: impl Fn() + 'static) -> DisposeHandle {
    let inner = Rc::new(EffectInner {
        run: RefCell::new(Box::new(f)),
        subscriber: RefCell::new(None),
        tracked: RefCell::new(Vec::new()),
        disposed: RefCell::new(false),
    });

    let inner_weak = Rc::downgrade(&inner);
    let id = with_runtime(|rt| rt.next_id());
    let subscriber = Subscriber::new(id, move || {
        if let Some(inner) = inner_weak.upgrade() {
            inner.execute();
        }
    });
    *inner.subscriber.borrow_mut() = Some(subscriber);

    inner.execute();

    DisposeHandle { inner }
}

#[cfg(test)]
mod tests {
    use super::super::Cell;
    use super::*;
    use std::cell::Cell as StdCell;

    #[test]
    fn runs_immediately_and_on_change() {
        let count = Rc::new(StdCell::new(0));
        let cell = Cell::new(0);
        let count_clone = count.clone();
        let cell_clone = cell.clone();
        let _handle = effect(move || {
            cell_clone.get();
            count_clone.set(count_clone.get() + 1);
        });

        assert_eq!(count.get(), 1);
        cell.set(1);
        assert_eq!(count.get(), 2);
    }

    #[test]
    fn dispose_stops_future_reruns() {
        let count = Rc::new(StdCell::new(0));
        let cell = Cell::new(0);
        let count_clone = count.clone();
        let cell_clone = cell.clone();
        let handle = effect(move || {
            cell_clone.get();
            count_clone.set(count_clone.get() + 1);
        });

        assert_eq!(count.get(), 1);
        handle.dispose();
        cell.set(1);
        assert_eq!(count.get(), 1);
    }
}
