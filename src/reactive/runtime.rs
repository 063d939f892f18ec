//! Thread-local dependency-tracking runtime shared by cells, computeds and effects.

use std::cell::RefCell;
use std::rc::Rc;

thread_local! {
    static RUNTIME: RefCell<Runtime> = RefCell::new(Runtime::new());
}

/// Execute a function with access to the runtime.
pub(crate) fn with_runtime<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|rt| f(&mut rt.borrow_mut()))
}

type Disposer = Box<dyn FnMut()>;

/// The reactive runtime manages the dependency graph: which subscriber is
/// currently reading cells, and (for effects) which cells it read so the
/// effect can later be disposed.
pub(crate) struct Runtime {
    subscriber_stack: Vec<Subscriber>,
    tracking_stack: Vec<Rc<RefCell<Vec<Disposer>>>>,
    next_id: u64,
    batching: bool,
    pending_notifications: Vec<Subscriber>,
}

impl Runtime {
    fn new() -> Self {
        Runtime {
            subscriber_stack: Vec::new(),
            tracking_stack: Vec::new(),
            next_id: 0,
            batching: false,
            pending_notifications: Vec::new(),
        }
    }

    pub(crate) fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub(crate) fn push_subscriber(&mut self, subscriber: Subscriber) {
        self.subscriber_stack.push(subscriber);
    }

    pub(crate) fn pop_subscriber(&mut self) -> Option<Subscriber> {
        self.subscriber_stack.pop()
    }

    pub(crate) fn current_subscriber(&self) -> Option<Subscriber> {
        self.subscriber_stack.last().cloned()
    }

    pub(crate) fn push_tracking_sink(&mut self, sink: Rc<RefCell<Vec<Disposer>>>) {
        self.tracking_stack.push(sink);
    }

    pub(crate) fn pop_tracking_sink(&mut self) -> Option<Rc<RefCell<Vec<Disposer>>>> {
        self.tracking_stack.pop()
    }

    pub(crate) fn current_tracking_sink(&self) -> Option<Rc<RefCell<Vec<Disposer>>>> {
        self.tracking_stack.last().cloned()
    }

    pub(crate) fn start_batch(&mut self) {
        self.batching = true;
    }

    /// End batching and return the subscribers that must still be notified.
    pub(crate) fn end_batch(&mut self) -> Vec<Subscriber> {
        self.batching = false;
        std::mem::take(&mut self.pending_notifications)
    }

    pub(crate) fn is_batching(&self) -> bool {
        self.batching
    }

    pub(crate) fn queue_notification(&mut self, subscriber: Subscriber) {
        if !self.pending_notifications.iter().any(|s| s.id == subscriber.id) {
            self.pending_notifications.push(subscriber);
        }
    }
}

/// A subscriber that can be notified when a cell changes.
#[derive(Clone)]
pub(crate) struct Subscriber {
    pub id: u64,
    callback: Rc<dyn Fn()>,
}

impl Subscriber {
    pub(crate) fn new(id: u64, callback: impl Fn() + 'static) -> Self {
        Subscriber {
            id,
            callback: Rc::new(callback),
        }
    }

    pub(crate) fn notify(&self) {
        // Decide-then-drop: the callback may itself touch the runtime (an
        // effect re-running pushes/pops a subscriber), so the runtime borrow
        // must not still be held when we call it.
        let should_invoke = with_runtime(|rt| {
            if rt.is_batching() {
                rt.queue_notification(self.clone());
                false
            } else {
                true
            }
        });
        if should_invoke {
            (self.callback)();
        }
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
