use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use crate::async_driver::Trigger;

type Listener<T> = Rc<dyn Fn(T)>;

struct SignalInner<T> {
    name: String,
    value: Cell<T>,
    changes: Cell<u64>,
    listeners: RefCell<Vec<Listener<T>>>,
}

/// Value-carrying wire between peripherals.
///
/// Listeners registered with [`Signal::on_change`] run synchronously inside
/// [`Signal::write`], and only when the written value differs from the
/// current one. Clones share the same wire.
pub struct Signal<T: Copy + PartialEq + 'static> {
    inner: Rc<SignalInner<T>>,
}

impl<T: Copy + PartialEq + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Copy + PartialEq + 'static> Signal<T> {
    pub fn new(name: &str, initial: T) -> Self {
        Self {
            inner: Rc::new(SignalInner {
                name: name.to_string(),
                value: Cell::new(initial),
                changes: Cell::new(0),
                listeners: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn read(&self) -> T {
        self.inner.value.get()
    }

    /// Returns `true` when the value changed and listeners were run.
    pub fn write(&self, value: T) -> bool {
        if self.inner.value.get() == value {
            return false;
        }
        self.inner.value.set(value);
        self.inner.changes.set(self.inner.changes.get() + 1);
        // Listeners may register further listeners or write other signals.
        let listeners: Vec<Listener<T>> = self.inner.listeners.borrow().clone();
        for listener in listeners {
            listener(value);
        }
        true
    }

    pub fn on_change<F>(&self, listener: F)
    where
        F: Fn(T) + 'static,
    {
        self.inner.listeners.borrow_mut().push(Rc::new(listener));
    }

    /// Notify `trigger` on every change of this signal.
    pub fn bind_trigger(&self, trigger: &Trigger) {
        let trigger = trigger.clone();
        self.on_change(move |_| trigger.notify());
    }

    pub fn change_count(&self) -> u64 {
        self.inner.changes.get()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.borrow().len()
    }
}

impl<T: Copy + PartialEq + fmt::Debug + 'static> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.inner.name)
            .field("value", &self.inner.value.get())
            .field("changes", &self.inner.changes.get())
            .finish()
    }
}
