//! Copy-on-write listener registry.
//!
//! Notifications run on pipeline tasks while listeners are added and removed
//! from the host. Dispatch works on a snapshot taken under a short read
//! lock, so a listener may unregister itself (or others) from inside a
//! callback without deadlocking, and the change takes effect from the next
//! dispatch on.

use parking_lot::RwLock;
use std::sync::Arc;

pub struct ListenerSet<L: ?Sized> {
    listeners: RwLock<Arc<Vec<Arc<L>>>>,
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Adds `listener` unless the same instance is already registered.
    pub fn add(&self, listener: Arc<L>) {
        let mut guard = self.listeners.write();
        if guard.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            return;
        }
        let mut updated = Vec::with_capacity(guard.len() + 1);
        updated.extend(guard.iter().cloned());
        updated.push(listener);
        *guard = Arc::new(updated);
    }

    /// Removes `listener`, returning whether it was registered.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut guard = self.listeners.write();
        if !guard.iter().any(|l| Arc::ptr_eq(l, listener)) {
            return false;
        }
        let updated: Vec<_> = guard
            .iter()
            .filter(|l| !Arc::ptr_eq(l, listener))
            .cloned()
            .collect();
        *guard = Arc::new(updated);
        true
    }

    pub fn clear(&self) {
        *self.listeners.write() = Arc::new(Vec::new());
    }

    pub fn snapshot(&self) -> Arc<Vec<Arc<L>>> {
        self.listeners.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Calls `f` for every listener registered when the call started.
    pub fn for_each(&self, mut f: impl FnMut(&L)) {
        for listener in self.snapshot().iter() {
            f(listener);
        }
    }
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    trait Listener: Send + Sync {
        fn notify(&self, value: i32);
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<i32>>,
    }

    impl Listener for Recorder {
        fn notify(&self, value: i32) {
            self.seen.lock().push(value);
        }
    }

    #[test]
    fn test_add_is_idempotent_per_instance() {
        let set: ListenerSet<dyn Listener> = ListenerSet::new();
        let a = Arc::new(Recorder::default());
        let a_dyn: Arc<dyn Listener> = a.clone();
        set.add(a_dyn.clone());
        set.add(a_dyn.clone());
        set.add(Arc::new(Recorder::default()));
        assert_eq!(set.len(), 2);

        set.for_each(|l| l.notify(7));
        assert_eq!(*a.seen.lock(), vec![7]);

        assert!(set.remove(&a_dyn));
        assert!(!set.remove(&a_dyn));
        assert_eq!(set.len(), 1);
    }

    struct SelfRemoving {
        set: Arc<ListenerSet<dyn Listener>>,
        me: Mutex<Option<Arc<dyn Listener>>>,
        calls: Mutex<i32>,
    }

    impl Listener for SelfRemoving {
        fn notify(&self, _value: i32) {
            *self.calls.lock() += 1;
            if let Some(me) = self.me.lock().take() {
                self.set.remove(&me);
            }
        }
    }

    #[test]
    fn test_listener_can_remove_itself_during_dispatch() {
        let set: Arc<ListenerSet<dyn Listener>> = Arc::new(ListenerSet::new());
        let listener = Arc::new(SelfRemoving {
            set: set.clone(),
            me: Mutex::new(None),
            calls: Mutex::new(0),
        });
        let as_dyn: Arc<dyn Listener> = listener.clone();
        *listener.me.lock() = Some(as_dyn.clone());
        set.add(as_dyn);

        set.for_each(|l| l.notify(1));
        set.for_each(|l| l.notify(2));
        assert_eq!(*listener.calls.lock(), 1);
        assert!(set.is_empty());
    }
}
