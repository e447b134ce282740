use std::sync::Arc;

use crate::{
    Read,
    broadcast::{Broadcast, BroadcastId},
    equality::{Equality, SameValue},
    error::SignalError,
    signal::{Get, ListenerGuard, Signal, Source, With},
    value::ValueCell,
};

/// A write request: either a literal value or a pure function of the previous value.
///
/// The updater runs while the cell is locked for writing, so it must not read or write
/// the same cell.
pub enum Update<'a, T> {
    Literal(T),
    Updater(Box<dyn FnOnce(&T) -> T + 'a>),
}

impl<'a, T> Update<'a, T> {
    pub fn with<F>(f: F) -> Self
    where F: FnOnce(&T) -> T + 'a {
        Update::Updater(Box::new(f))
    }

    fn resolve(self, current: &T) -> T {
        match self {
            Update::Literal(value) => value,
            Update::Updater(f) => f(current),
        }
    }
}

impl<T> From<T> for Update<'_, T> {
    fn from(value: T) -> Self { Update::Literal(value) }
}

/// Mutable (stateful) signal.
///
/// Writes are gated by the cell's [`Equality`]; a write that changes the value notifies every
/// listener synchronously, in registration order, before `set` returns.
/// The equality and any updater run under the cell's write lock and must not touch this cell.
/// Cloning a `Mut` shares the same value and listeners.
pub struct Mut<T> {
    value: ValueCell<T>,
    broadcast: Broadcast<T>,
    equality: Equality<T>,
}

impl<T> Clone for Mut<T> {
    fn clone(&self) -> Self { Self { value: self.value.clone(), broadcast: self.broadcast.clone(), equality: self.equality.clone() } }
}

impl<T: SameValue + 'static> Mut<T> {
    /// Create a cell gated by identity equality
    pub fn new(value: T) -> Self { Self::with_equality(value, Equality::identity()) }
}

impl<T: 'static> Mut<T> {
    pub fn with_equality(value: T, equality: Equality<T>) -> Self {
        Self { value: ValueCell::new(value), broadcast: Broadcast::new(), equality }
    }

    /// Readonly signal downstream of this mutable signal
    pub fn read(&self) -> Read<T> { Read { value: self.value.clone(), broadcast: self.broadcast.clone() } }

    /// Number of listeners currently registered on this cell
    pub fn subscriber_count(&self) -> usize { self.broadcast.listener_count() }
}

impl<T: Clone + 'static> Mut<T> {
    /// Set a new value. Returns whether listeners were notified.
    pub fn set(&self, value: T) -> bool { self.apply(Update::Literal(value)) }

    /// Derive the new value from the previous one. Returns whether listeners were notified.
    pub fn update<F>(&self, f: F) -> bool
    where F: FnOnce(&T) -> T {
        self.apply(Update::with(f))
    }

    pub fn apply(&self, update: Update<'_, T>) -> bool {
        let equality = &self.equality;
        let changed = self.value.replace_with(|current| {
            let candidate = update.resolve(current);
            if equality.is_equal(current, &candidate) { None } else { Some(candidate) }
        });

        match changed {
            // The write lock is released before listeners run, so they may read or set re-entrantly
            Some(value) => {
                self.broadcast.send(value);
                true
            }
            None => false,
        }
    }
}

impl<T: Clone + 'static> Get<T> for Mut<T> {
    fn get(&self) -> T { self.value.value() }
}

impl<T: 'static> With<T> for Mut<T> {
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R { self.value.with(f) }
}

impl<T: 'static> Signal for Mut<T> {
    fn listen(&self, listener: Arc<dyn Fn() + Send + Sync>) -> ListenerGuard { ListenerGuard::new(self.broadcast.reference().listen(listener)) }

    fn broadcast_id(&self) -> BroadcastId { self.broadcast.id() }
}

impl<T> Source<T> for Mut<T>
where T: Clone + Send + Sync + 'static
{
    fn listen_value(&self, listener: Arc<dyn Fn(T) + Send + Sync>) -> ListenerGuard {
        ListenerGuard::new(self.broadcast.reference().listen(listener))
    }

    fn read(&self) -> Result<T, SignalError> { Ok(self.value.value()) }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Mut<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.with(|value| f.debug_struct("Mut").field("value", value).field("broadcast", &self.broadcast).finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_set_and_get() {
        let signal = Mut::new(0);
        assert!(signal.set(5));
        assert_eq!(signal.get(), 5);
        assert!(!signal.set(5));
    }

    #[test]
    fn test_update_from_previous() {
        let signal = Mut::new(10);
        assert!(signal.update(|value| value + 1));
        assert_eq!(signal.get(), 11);
        assert!(!signal.update(|value| *value));
        assert!(signal.apply(Update::from(3)));
        assert_eq!(signal.get(), 3);
    }

    #[test]
    fn test_panicking_updater_leaves_value() {
        let signal = Mut::new(1);
        assert!(!signal.update(|_| panic!("bad updater")));
        assert_eq!(signal.get(), 1);
        // Still writable afterwards
        assert!(signal.set(2));
        assert_eq!(signal.get(), 2);
    }

    #[test]
    fn test_custom_equality() {
        let signal = Mut::with_equality("Hello".to_string(), Equality::custom(|a: &String, b: &String| a.eq_ignore_ascii_case(b)));
        assert!(!signal.set("HELLO".to_string()));
        assert_eq!(signal.get(), "Hello");
        assert!(signal.set("bye".to_string()));
    }

    #[test]
    fn test_never_equality_always_notifies() {
        let signal = Mut::with_equality(1, Equality::never());
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = {
            let count = count.clone();
            signal.listen_value(Arc::new(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            }))
        };
        signal.set(1);
        signal.set(1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reentrant_set_from_listener() {
        let signal = Mut::new(0);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let _bump = {
            let signal = signal.clone();
            signal.clone().listen_value(Arc::new(move |value: i32| {
                if value < 3 {
                    signal.set(value + 1);
                }
            }))
        };
        let _record = {
            let seen = seen.clone();
            signal.listen_value(Arc::new(move |value: i32| seen.lock().unwrap().push(value)))
        };

        signal.set(1);
        assert_eq!(signal.get(), 3);
        // Nested passes are not coalesced: each set runs its own full pass
        assert_eq!(*seen.lock().unwrap(), vec![3, 2, 1]);
    }
}
