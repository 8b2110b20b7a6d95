//! # Observation registry
//!
//! Synchronous pub/sub fanout used by fields and entities.
//!
//! Two subscription classes:
//!
//! - **anonymous** (`subscribe`): lives until `unsubscribe(id)`.
//! - **owner-scoped** (`subscribe_owned`): tied to a `Weak` owner handle. Once
//!   the owner is dropped the callback is never invoked again and the entry is
//!   pruned on the next notification.
//!
//! # Invariants
//!
//! 1. `notify` runs every live callback on the calling thread, in
//!    registration order, before returning.
//! 2. The callback list is snapshotted before fanout, so callbacks may
//!    subscribe or unsubscribe without deadlocking. Changes take effect on the
//!    next notification.
//! 3. No lock is held while a callback runs.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

/// Handle returned by every subscribe call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

enum Lifetime {
    Anonymous,
    Owned(Weak<dyn Any + Send + Sync>),
}

impl Lifetime {
    fn is_live(&self) -> bool {
        match self {
            Lifetime::Anonymous => true,
            Lifetime::Owned(owner) => owner.strong_count() > 0,
        }
    }

    fn is_owned_by(&self, addr: *const ()) -> bool {
        match self {
            Lifetime::Anonymous => false,
            Lifetime::Owned(owner) => std::ptr::addr_eq(owner.as_ptr(), addr),
        }
    }
}

struct Entry<T> {
    id: SubscriptionId,
    lifetime: Lifetime,
    callback: Callback<T>,
}

struct ObserversInner<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

/// A list of subscribers for values of type `T`.
///
/// Cloning an `Observers` creates a new handle to the **same** list.
pub struct Observers<T> {
    inner: Arc<ObserversInner<T>>,
}

impl<T> Clone for Observers<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: 'static> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Observers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscriptions", &self.inner.entries.lock().len())
            .finish()
    }
}

impl<T: 'static> Observers<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ObserversInner {
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    fn push(&self, lifetime: Lifetime, callback: Callback<T>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.entries.lock().push(Entry { id, lifetime, callback });
        id
    }

    /// Anonymous subscription. Stays until [`unsubscribe`](Self::unsubscribe).
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        self.push(Lifetime::Anonymous, Arc::new(callback))
    }

    /// Subscription that dies with `owner`.
    pub fn subscribe_owned<O>(
        &self,
        owner: &Arc<O>,
        callback: impl Fn(&T) + Send + Sync + 'static,
    ) -> SubscriptionId
    where
        O: Any + Send + Sync,
    {
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(owner) as Weak<O>;
        self.push(Lifetime::Owned(weak), Arc::new(callback))
    }

    /// Remove one subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    /// Remove every subscription scoped to `owner`. Returns how many went.
    pub fn unsubscribe_owner<O: Any + Send + Sync>(&self, owner: &Arc<O>) -> usize {
        let addr = Arc::as_ptr(owner) as *const ();
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|e| !e.lifetime.is_owned_by(addr));
        before - entries.len()
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().iter().filter(|e| e.lifetime.is_live()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fan `value` out to every live subscriber.
    pub fn notify(&self, value: &T) {
        let callbacks: Vec<Callback<T>> = {
            let mut entries = self.inner.entries.lock();
            entries.retain(|e| e.lifetime.is_live());
            entries.iter().map(|e| Arc::clone(&e.callback)).collect()
        };
        for callback in callbacks {
            callback(value);
        }
    }

    /// Build a downstream registry fed by this one.
    ///
    /// Values for which `map` returns `None` are not forwarded. The link is
    /// scoped to the returned registry: once every handle to it is dropped,
    /// this registry stops forwarding.
    pub fn chain<U, F>(&self, map: F) -> Observers<U>
    where
        U: 'static,
        F: Fn(&T) -> Option<U> + Send + Sync + 'static,
    {
        let downstream = Observers::<U>::new();
        let weak = Arc::downgrade(&downstream.inner);
        self.subscribe_owned(&downstream.inner, move |value| {
            let Some(inner) = weak.upgrade() else { return };
            if let Some(mapped) = map(value) {
                Observers { inner }.notify(&mapped);
            }
        });
        downstream
    }
}

// ============================================================================
// Re-entrancy guard
// ============================================================================

/// Flag used to suppress notifications that arrive while the same
/// propagation is already running (bindings, cyclic entity graphs).
#[derive(Debug, Default)]
pub struct ReentrancyFlag(AtomicBool);

/// Clears the flag on drop.
pub struct ReentrancyToken<'a>(&'a ReentrancyFlag);

impl ReentrancyFlag {
    pub fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// `None` when a propagation is already in progress.
    pub fn enter(&self) -> Option<ReentrancyToken<'_>> {
        self.0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReentrancyToken(self))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Drop for ReentrancyToken<'_> {
    fn drop(&mut self) {
        self.0.0.store(false, Ordering::Release);
    }
}

// ============================================================================
// Binding
// ============================================================================

/// A live link between observables. Dropping it leaves the link in place;
/// call [`unbind`](Binding::unbind) to tear it down.
#[must_use = "a binding can only be removed through its handle"]
pub struct Binding {
    detach: Vec<Box<dyn FnOnce() + Send + Sync>>,
}

impl Binding {
    pub(crate) fn new(detach: Vec<Box<dyn FnOnce() + Send + Sync>>) -> Self {
        Self { detach }
    }

    pub fn unbind(self) {
        for detach in self.detach {
            detach();
        }
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding").field("links", &self.detach.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder<T: Clone + Send + 'static>() -> (Arc<Mutex<Vec<T>>>, impl Fn(&T) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |v: &T| sink.lock().push(v.clone()))
    }

    #[test]
    fn test_anonymous_subscription() {
        let observers = Observers::<i64>::new();
        let (seen, cb) = recorder();
        let id = observers.subscribe(cb);

        observers.notify(&1);
        observers.notify(&2);
        assert!(observers.unsubscribe(id));
        observers.notify(&3);

        assert_eq!(*seen.lock(), vec![1, 2]);
        assert!(!observers.unsubscribe(id));
    }

    #[test]
    fn test_owner_scoped_subscription_dies_with_owner() {
        let observers = Observers::<i64>::new();
        let owner = Arc::new(());
        let (seen, cb) = recorder();
        observers.subscribe_owned(&owner, cb);

        observers.notify(&1);
        drop(owner);
        observers.notify(&2);

        assert_eq!(*seen.lock(), vec![1]);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_unsubscribe_owner() {
        let observers = Observers::<i64>::new();
        let owner = Arc::new(String::from("owner"));
        observers.subscribe_owned(&owner, |_| {});
        observers.subscribe_owned(&owner, |_| {});
        observers.subscribe(|_| {});

        assert_eq!(observers.unsubscribe_owner(&owner), 2);
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_registration_order() {
        let observers = Observers::<()>::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = Arc::clone(&order);
            observers.subscribe(move |_| order.lock().push(i));
        }
        observers.notify(&());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn test_reentrant_subscribe_does_not_deadlock() {
        let observers = Observers::<i64>::new();
        let handle = observers.clone();
        observers.subscribe(move |_| {
            handle.subscribe(|_| {});
        });
        observers.notify(&1);
        assert_eq!(observers.len(), 2);
    }

    #[test]
    fn test_chain_pipeline() {
        let a = Observers::<i64>::new();
        let b = a.chain(|v| (*v % 2 == 0).then_some(*v * 10));
        let c = b.chain(|v| Some(format!("#{v}")));
        let (seen, cb) = recorder::<String>();
        c.subscribe(cb);

        a.notify(&1);
        a.notify(&2);
        a.notify(&4);
        assert_eq!(*seen.lock(), vec!["#20".to_string(), "#40".to_string()]);

        drop(b);
        drop(c);
        a.notify(&6);
        assert!(a.is_empty());
    }

    #[test]
    fn test_reentrancy_flag() {
        let flag = ReentrancyFlag::new();
        let token = flag.enter();
        assert!(token.is_some());
        assert!(flag.is_active());
        assert!(flag.enter().is_none());
        drop(token);
        assert!(flag.enter().is_some());
    }
}
