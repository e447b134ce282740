use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::error::panic_message;
use crate::lock::{read, write};

/// A unique identifier for a broadcast that cannot be forged or extracted.
/// Can only be created by a Broadcast and used for deduplication/comparison.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct BroadcastId(usize);

impl From<BroadcastId> for usize {
    fn from(id: BroadcastId) -> usize { id.0 }
}

impl std::fmt::Display for BroadcastId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{:#x}", self.0) }
}

/// A listener that can be called when broadcast notifications are sent.
/// Supports both full listeners (receive value) and unit listeners (notification only).
pub enum BroadcastListener<T = ()> {
    /// Full listener receives the broadcast value
    Payload(Arc<dyn Fn(T) + Send + Sync + 'static>),
    /// Unit listener only receives notification, ignores the value
    NotifyOnly(Arc<dyn Fn() + Send + Sync + 'static>),
}

impl<T> Clone for BroadcastListener<T> {
    fn clone(&self) -> Self {
        match self {
            BroadcastListener::Payload(listener) => BroadcastListener::Payload(listener.clone()),
            BroadcastListener::NotifyOnly(listener) => BroadcastListener::NotifyOnly(listener.clone()),
        }
    }
}

/// Trait for types that can be converted into broadcast listeners.
pub trait IntoBroadcastListener<T> {
    /// Convert this type into a listener function that can be called on notifications.
    fn into_broadcast_listener(self) -> BroadcastListener<T>;
}

/// An ordered multicast sender.
///
/// Listeners are called synchronously, in the order they were registered. A listener that
/// panics is logged and skipped; the remaining listeners still receive the value.
pub struct Broadcast<T = ()>(Arc<Inner<T>>);

impl<T> Clone for Broadcast<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

struct Inner<T> {
    // Keyed by a monotonic id, so iteration order is registration order
    listeners: RwLock<BTreeMap<usize, BroadcastListener<T>>>,
    next_id: AtomicUsize,
}

impl<T> std::fmt::Debug for Broadcast<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast").field("id", &self.id()).field("listeners", &self.listener_count()).finish()
    }
}

/// A listen-only reference to a broadcast
pub struct Ref<'a, T>(&'a Broadcast<T>);

/// A subscription handle that unsubscribes when dropped.
pub struct ListenerGuard<T = ()> {
    inner: Weak<Inner<T>>,
    id: usize,
}

impl<T> ListenerGuard<T> {
    /// Get the broadcast ID that this guard is subscribed to
    pub fn broadcast_id(&self) -> BroadcastId {
        // A ListenerGuard does not keep the broadcast alive, but the address stays reserved
        // until every Arc/Weak is gone, so it cannot be reused while this guard exists.
        BroadcastId(self.inner.as_ptr() as usize)
    }
}

impl<T> Default for Broadcast<T> {
    fn default() -> Self { Self::new() }
}

impl<T> Broadcast<T> {
    /// Creates a new Broadcast struct
    pub fn new() -> Self { Self(Arc::new(Inner { listeners: RwLock::new(BTreeMap::new()), next_id: AtomicUsize::new(0) })) }

    /// Get the unique identifier for this broadcast
    pub fn id(&self) -> BroadcastId { BroadcastId(Arc::as_ptr(&self.0) as usize) }

    /// Number of listeners currently registered
    pub fn listener_count(&self) -> usize { read(&self.0.listeners).len() }

    /// Get a read-only reference to this sender that can only subscribe to notifications.
    /// This avoids cloning the sender while still forbidding the user from sending notifications.
    pub fn reference(&self) -> Ref<'_, T> { Ref(self) }

    fn is_registered(&self, id: usize) -> bool { read(&self.0.listeners).contains_key(&id) }
}

impl<T: Clone> Broadcast<T> {
    /// Sends a notification to all active listeners
    pub fn send(&self, value: T) {
        // Snapshot the listeners so callbacks may subscribe, unsubscribe or send re-entrantly
        let listeners = {
            let listeners = read(&self.0.listeners);
            listeners.iter().map(|(id, listener)| (*id, listener.clone())).collect::<Vec<_>>()
        };

        // clone the value for each listener except the last one
        if let Some(((last_id, last), rest)) = listeners.split_last() {
            for (id, listener) in rest {
                self.deliver(*id, listener, value.clone());
            }
            self.deliver(*last_id, last, value);
        }
    }

    fn deliver(&self, id: usize, listener: &BroadcastListener<T>, value: T) {
        // A listener removed by an earlier callback in this pass must not be called
        if !self.is_registered(id) {
            return;
        }
        let result = catch_unwind(AssertUnwindSafe(|| match listener {
            BroadcastListener::Payload(callback) => callback(value),
            BroadcastListener::NotifyOnly(callback) => callback(),
        }));
        if let Err(payload) = result {
            tracing::warn!("listener {} on broadcast {} panicked: {}", id, self.id(), panic_message(&*payload));
        }
    }
}

impl<T> Ref<'_, T> {
    /// Subscribe to notifications from the associated sender.
    pub fn listen<L>(&self, listener: L) -> ListenerGuard<T>
    where L: IntoBroadcastListener<T> {
        let id = self.0.0.next_id.fetch_add(1, Ordering::Relaxed);
        write(&self.0.0.listeners).insert(id, listener.into_broadcast_listener());
        ListenerGuard { inner: Arc::downgrade(&self.0.0), id }
    }

    /// Get a unique identifier for this broadcast (for deduplication purposes)
    pub fn broadcast_id(&self) -> BroadcastId { self.0.id() }
}

impl<T> Drop for ListenerGuard<T> {
    /// Automatically unsubscribes when the subscription handle is dropped.
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            // Bind the removed listener so it is dropped after the lock is released
            let _removed = write(&inner.listeners).remove(&self.id);
        }
    }
}

// IntoBroadcastListener implementations for various types

impl<F, T> IntoBroadcastListener<T> for F
where F: Fn(T) + Send + Sync + 'static
{
    fn into_broadcast_listener(self) -> BroadcastListener<T> { BroadcastListener::Payload(Arc::new(self)) }
}

impl<T> IntoBroadcastListener<T> for BroadcastListener<T> {
    fn into_broadcast_listener(self) -> BroadcastListener<T> { self }
}

impl<T> IntoBroadcastListener<T> for Arc<dyn Fn(T) + Send + Sync + 'static> {
    fn into_broadcast_listener(self) -> BroadcastListener<T> { BroadcastListener::Payload(self) }
}

// Unit listeners work with any broadcast type
impl<T> IntoBroadcastListener<T> for Arc<dyn Fn() + Send + Sync + 'static> {
    fn into_broadcast_listener(self) -> BroadcastListener<T> { BroadcastListener::NotifyOnly(self) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_multiple_subscribers() {
        let sender = Broadcast::<()>::new();

        let counter = Arc::new(Mutex::new(0));

        let _sub1 = {
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 1)
        };

        let sub2 = {
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 10)
        };

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 11);

        drop(sub2);

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 12);
        assert_eq!(sender.listener_count(), 1);
    }

    #[test]
    fn test_registration_order() {
        let sender = Broadcast::<u32>::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let _guards: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                sender.reference().listen(move |value: u32| order.lock().unwrap().push((i, value)))
            })
            .collect();

        sender.send(9);
        assert_eq!(*order.lock().unwrap(), vec![(0, 9), (1, 9), (2, 9), (3, 9), (4, 9)]);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let sender = Broadcast::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _first = {
            let seen = seen.clone();
            sender.reference().listen(move |value: u32| seen.lock().unwrap().push(("first", value)))
        };
        fn explode(_: u32) { panic!("listener failure") }
        let _bad = sender.reference().listen(explode);
        let _last = {
            let seen = seen.clone();
            sender.reference().listen(move |value: u32| seen.lock().unwrap().push(("last", value)))
        };

        sender.send(1);
        sender.send(2);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 1), ("last", 1), ("first", 2), ("last", 2)]);
        assert_eq!(sender.listener_count(), 3);
    }

    #[test]
    fn test_unsubscribed_during_send_is_skipped() {
        let sender = Broadcast::<()>::new();
        let counter = Arc::new(Mutex::new(0));
        let victim: Arc<Mutex<Option<ListenerGuard<()>>>> = Arc::new(Mutex::new(None));

        let _killer = {
            let victim = victim.clone();
            sender.reference().listen(move |_| {
                victim.lock().unwrap().take();
            })
        };
        *victim.lock().unwrap() = Some({
            let counter = counter.clone();
            sender.reference().listen(move |_| *counter.lock().unwrap() += 1)
        });

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 0);
        assert_eq!(sender.listener_count(), 1);
    }

    #[test]
    fn test_reentrant_subscription_during_send() {
        let sender = Broadcast::<()>::new();
        let counter = Arc::new(Mutex::new(0));

        let sender_clone = sender.clone();
        let counter_clone = counter.clone();
        let _sub = sender.reference().listen(move |_| {
            *counter_clone.lock().unwrap() += 1;

            // Subscribing and dropping inside a callback must not deadlock
            let _temp_sub = sender_clone.reference().listen(|_| {});
        });

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 1);

        sender.send(());
        assert_eq!(*counter.lock().unwrap(), 2);
    }

    #[test]
    fn test_notify_only_listener() {
        let sender = Broadcast::<String>::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let listener: Arc<dyn Fn() + Send + Sync> = {
            let counter = counter.clone();
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        };
        let _guard = sender.reference().listen(listener);
        sender.send("hello".to_string());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
