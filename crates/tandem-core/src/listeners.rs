//! Listener registries
//!
//! Every adapter, store and engine owns its own registry; there is no
//! process-wide listener state. Notification order is insertion order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identity of a registered listener
pub type ListenerId = u64;

/// Ordered collection of listeners, removable by identity
pub struct Registry<L: ?Sized> {
    entries: Mutex<Vec<(ListenerId, Arc<L>)>>,
    next_id: AtomicU64,
}

impl<L: ?Sized> Default for Registry<L> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<L: ?Sized> Registry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener, returning its identity
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().push((id, listener));
        id
    }

    /// Remove a listener; returns false if it was not registered
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }

    /// Current listeners in notification order
    ///
    /// Callers iterate the returned copy so that listeners may add or
    /// remove registrations while being notified.
    pub fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock().iter().map(|(_, l)| Arc::clone(l)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ListenerId, Arc<L>)>> {
        // A panicking listener never runs under this lock
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<L: ?Sized> fmt::Debug for Registry<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

/// Handle returned by every `subscribe`
///
/// Unsubscribing is explicit; dropping the handle leaves the listener
/// registered.
#[must_use = "dropping a Subscription does not unsubscribe; call unsubscribe() to cancel"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// A subscription with nothing to cancel
    pub fn noop() -> Self {
        Self { cancel: None }
    }

    /// Remove the listener this handle was created for
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Callback = dyn Fn() -> u32 + Send + Sync;

    #[test]
    fn test_registry_preserves_order() {
        let registry: Registry<Callback> = Registry::new();
        registry.add(Arc::new(|| 1));
        registry.add(Arc::new(|| 2));
        registry.add(Arc::new(|| 3));

        let results: Vec<u32> = registry.snapshot().iter().map(|f| f()).collect();
        assert_eq!(results, vec![1, 2, 3]);
    }

    #[test]
    fn test_registry_remove_by_identity() {
        let registry: Registry<Callback> = Registry::new();
        let first = registry.add(Arc::new(|| 1));
        registry.add(Arc::new(|| 2));

        assert!(registry.remove(first));
        assert!(!registry.remove(first));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0](), 2);
    }

    #[test]
    fn test_subscription_runs_cancel_once() {
        let registry: Arc<Registry<Callback>> = Arc::new(Registry::new());
        let id = registry.add(Arc::new(|| 1));
        let weak = Arc::downgrade(&registry);
        let subscription = Subscription::new(move || {
            if let Some(registry) = weak.upgrade() {
                registry.remove(id);
            }
        });

        subscription.unsubscribe();
        assert!(registry.is_empty());
        Subscription::noop().unsubscribe();
    }
}
