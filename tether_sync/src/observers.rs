use parking_lot::Mutex as SyncMutex;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A shareable observer callback for events of type `E`.
pub type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Identifies a registration in [`Observers`], for explicit removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle(u64);

/// An ordered registry of observers interested in events of type `E`.
///
/// Observers are held either strongly, keeping them alive for as long as they
/// are registered, or [weakly](Observers::add_weak), in which case the
/// registry never extends their lifetime and silently forgets them once they
/// are dropped elsewhere.
///
/// Notification takes a snapshot of the registry and invokes the observers
/// without holding any lock, so observers may freely (un)register others.
pub struct Observers<E> {
    next_id: AtomicU64,
    entries: SyncMutex<Vec<Entry<E>>>,
}

struct Entry<E> {
    handle: ObserverHandle,
    slot: Slot<E>,
}

enum Slot<E> {
    Strong(Observer<E>),
    Weak(Weak<dyn Fn(&E) + Send + Sync>),
}

impl<E> Slot<E> {
    fn upgrade(&self) -> Option<Observer<E>> {
        match self {
            Slot::Strong(observer) => Some(Arc::clone(observer)),
            Slot::Weak(observer) => observer.upgrade(),
        }
    }
}

impl<E> Observers<E> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: SyncMutex::new(Vec::new()),
        }
    }

    /// Registers the given closure, holding it strongly.
    pub fn add<F>(&self, observer: F) -> ObserverHandle
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.push(Slot::Strong(Arc::new(observer)))
    }

    /// Registers the given shared observer, holding it strongly.
    pub fn add_shared(&self, observer: Observer<E>) -> ObserverHandle {
        self.push(Slot::Strong(observer))
    }

    /// Registers the given shared observer without extending its lifetime.
    pub fn add_weak(&self, observer: &Observer<E>) -> ObserverHandle {
        self.push(Slot::Weak(Arc::downgrade(observer)))
    }

    fn push(&self, slot: Slot<E>) -> ObserverHandle {
        let handle = ObserverHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Entry { handle, slot });

        handle
    }

    /// Removes the registration with the given handle. Returns `false` if no
    /// such registration exists (anymore).
    pub fn remove(&self, handle: ObserverHandle) -> bool {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|entry| entry.handle != handle);

        entries.len() != before
    }

    /// Removes all registrations.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Reports the number of live registrations.
    pub fn len(&self) -> usize {
        self.prune();
        self.entries.lock().len()
    }

    /// Reports whether there are no live registrations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes every live observer with the given event, in registration
    /// order. Returns the number of observers invoked.
    pub fn notify(&self, event: &E) -> usize {
        let snapshot = self.snapshot();

        for observer in &snapshot {
            observer(event);
        }

        snapshot.len()
    }

    fn snapshot(&self) -> Vec<Observer<E>> {
        let mut entries = self.entries.lock();
        let mut snapshot = Vec::with_capacity(entries.len());

        entries.retain(|entry| match entry.slot.upgrade() {
            Some(observer) => {
                snapshot.push(observer);
                true
            }
            None => false,
        });

        snapshot
    }

    fn prune(&self) {
        self.entries.lock().retain(|entry| match &entry.slot {
            Slot::Strong(_) => true,
            Slot::Weak(observer) => observer.strong_count() > 0,
        });
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Debug for Observers<E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn notify_in_order() {
        // Given
        let observers = Observers::<u8>::new();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let seen_a = Arc::clone(&seen);
        let seen_b = Arc::clone(&seen);
        observers.add(move |event| seen_a.lock().push(("a", *event)));
        observers.add(move |event| seen_b.lock().push(("b", *event)));

        // When
        let notified = observers.notify(&9);

        // Then
        assert_eq!(notified, 2);
        assert_eq!(*seen.lock(), vec![("a", 9), ("b", 9)]);
    }

    #[test]
    fn remove_by_handle() {
        // Given
        let observers = Observers::<()>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let handle = observers.add(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        // When
        let removed = observers.remove(handle);
        let removed_again = observers.remove(handle);
        observers.notify(&());

        // Then
        assert!(removed);
        assert!(!removed_again);
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn weak_observer_does_not_keep_alive() {
        // Given
        let observers = Observers::<()>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);
        let observer: Observer<()> = Arc::new(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });
        observers.add_weak(&observer);

        // When
        observers.notify(&());
        drop(observer);
        let notified = observers.notify(&());

        // Then
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert_eq!(notified, 0);
        assert!(observers.is_empty());
    }

    #[test]
    fn observer_may_register_another() {
        // Given
        let observers = Arc::new(Observers::<()>::new());
        let inner = Arc::clone(&observers);
        observers.add(move |_| {
            inner.add(|_| {});
        });

        // When
        observers.notify(&());

        // Then
        assert_eq!(observers.len(), 2);
    }
}
