//! Reference counting for shared render buffers
//!
//! A [`ReferenceManager`] counts the live [`Reference`]s it handed out and
//! tells its observers about every change of the count. What to do about a
//! change (schedule eviction, recycle a crop buffer) is up to the observers.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_REFERENCE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a [`Reference`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReferenceId(u64);

type Observer = Rc<dyn Fn(i64)>;

struct ManagerState {
    count: Cell<i64>,
    observers: RefCell<Vec<(u64, Observer)>>,
    next_observer: Cell<u64>,
}

/// Counts active references and notifies observers on every transition.
///
/// Cloning yields another handle to the same counter.
#[derive(Clone)]
pub struct ReferenceManager {
    state: Rc<ManagerState>,
}

impl ReferenceManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Rc::new(ManagerState {
                count: Cell::new(0),
                observers: RefCell::new(Vec::new()),
                next_observer: Cell::new(0),
            }),
        }
    }

    /// Number of currently active references
    #[must_use]
    pub fn count(&self) -> i64 {
        self.state.count.get()
    }

    /// Increment the count and hand out a new active reference
    #[must_use = "dropping the reference releases it immediately"]
    pub fn create_retained_ref(&self) -> Reference {
        self.inc();
        Reference {
            id: ReferenceId(NEXT_REFERENCE_ID.fetch_add(1, Ordering::Relaxed)),
            active: Cell::new(true),
            manager: self.clone(),
            listeners: RefCell::new(Vec::new()),
        }
    }

    /// Register an observer called with the new count after every change.
    ///
    /// Observers run synchronously in registration order. Past transitions
    /// are not replayed.
    pub fn subscribe(&self, observer: impl Fn(i64) + 'static) -> Subscription {
        let id = self.state.next_observer.get();
        self.state.next_observer.set(id + 1);
        self.state
            .observers
            .borrow_mut()
            .push((id, Rc::new(observer)));
        Subscription {
            manager: Rc::downgrade(&self.state),
            id,
        }
    }

    /// Number of registered observers
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.state.observers.borrow().len()
    }

    fn inc(&self) {
        let count = self.state.count.get() + 1;
        self.state.count.set(count);
        self.notify(count);
    }

    fn dec(&self) {
        let count = self.state.count.get() - 1;
        self.state.count.set(count);
        self.notify(count);
    }

    fn notify(&self, count: i64) {
        // Observers may subscribe or unsubscribe while being notified.
        let observers: Vec<Observer> = self
            .state
            .observers
            .borrow()
            .iter()
            .map(|(_, observer)| Rc::clone(observer))
            .collect();
        for observer in observers {
            observer(count);
        }
    }
}

impl Default for ReferenceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReferenceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceManager")
            .field("count", &self.count())
            .field("observers", &self.observer_count())
            .finish()
    }
}

/// Handle for removing an observer.
///
/// Dropping it leaves the observer registered.
#[derive(Debug)]
pub struct Subscription {
    manager: Weak<ManagerState>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {
        if let Some(state) = self.manager.upgrade() {
            state.observers.borrow_mut().retain(|(id, _)| *id != self.id);
        }
    }
}

/// One consumer's claim on a counted resource.
///
/// Active until released; `release` is idempotent and dropping an active
/// reference releases it.
pub struct Reference {
    id: ReferenceId,
    active: Cell<bool>,
    manager: ReferenceManager,
    listeners: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl Reference {
    #[must_use]
    pub fn id(&self) -> ReferenceId {
        self.id
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// Run `listener` once this reference is released.
    ///
    /// Listeners added after release never run.
    pub fn on_release(&self, listener: impl FnOnce() + 'static) {
        if self.is_active() {
            self.listeners.borrow_mut().push(Box::new(listener));
        }
    }

    /// Give up the claim: decrement the manager's count, then run the release listeners
    pub fn release(&self) {
        if !self.active.replace(false) {
            return;
        }
        self.manager.dec();
        let listeners = std::mem::take(&mut *self.listeners.borrow_mut());
        for listener in listeners {
            listener();
        }
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(manager: &ReferenceManager) -> Rc<RefCell<Vec<i64>>> {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        manager.subscribe(move |count| sink.borrow_mut().push(count));
        seen
    }

    #[test]
    fn count_tracks_created_minus_released() {
        let manager = ReferenceManager::new();
        let a = manager.create_retained_ref();
        let b = manager.create_retained_ref();
        let c = manager.create_retained_ref();
        assert_eq!(manager.count(), 3);

        b.release();
        assert_eq!(manager.count(), 2);
        a.release();
        c.release();
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let manager = ReferenceManager::new();
        let seen = recorder(&manager);
        let fired = Rc::new(Cell::new(0));

        let reference = manager.create_retained_ref();
        let counter = Rc::clone(&fired);
        reference.on_release(move || counter.set(counter.get() + 1));

        reference.release();
        reference.release();
        drop(reference);

        assert_eq!(manager.count(), 0);
        assert_eq!(fired.get(), 1);
        assert_eq!(*seen.borrow(), vec![1, 0]);
    }

    #[test]
    fn drop_releases_active_reference() {
        let manager = ReferenceManager::new();
        {
            let _reference = manager.create_retained_ref();
            assert_eq!(manager.count(), 1);
        }
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn observers_are_not_replayed() {
        let manager = ReferenceManager::new();
        let _early = manager.create_retained_ref();
        let seen = recorder(&manager);
        assert!(seen.borrow().is_empty());

        let _late = manager.create_retained_ref();
        assert_eq!(*seen.borrow(), vec![2]);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let manager = ReferenceManager::new();
        let seen = Rc::new(Cell::new(0));
        let sink = Rc::clone(&seen);
        let subscription = manager.subscribe(move |_| sink.set(sink.get() + 1));

        let a = manager.create_retained_ref();
        subscription.unsubscribe();
        a.release();

        assert_eq!(seen.get(), 1);
        assert_eq!(manager.observer_count(), 0);
    }

    #[test]
    fn observer_may_create_references() {
        let manager = ReferenceManager::new();
        let held = Rc::new(RefCell::new(Vec::new()));
        let inner = manager.clone();
        let store = Rc::clone(&held);
        manager.subscribe(move |count| {
            if count == 0 {
                store.borrow_mut().push(inner.create_retained_ref());
            }
        });

        manager.create_retained_ref().release();
        assert_eq!(manager.count(), 1);
        assert_eq!(held.borrow().len(), 1);
    }

    #[test]
    fn reference_ids_are_unique() {
        let manager = ReferenceManager::new();
        let a = manager.create_retained_ref();
        let b = manager.create_retained_ref();
        assert_ne!(a.id(), b.id());
    }
}
