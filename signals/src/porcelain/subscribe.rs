use std::sync::Arc;

use crate::{
    Mut, Read,
    signal::{ListenerGuard, Source},
};

/// Type alias for subscribe listeners
pub type SubscribeListener<T> = Box<dyn Fn(T) + Send + Sync + 'static>;

/// Trait for types that can be converted into subscribe listeners
pub trait IntoSubscribeListener<T> {
    fn into_subscribe_listener(self) -> SubscribeListener<T>;
}

/// Trait for subscribing to changes - provides the subscribe method
pub trait Subscribe<T: 'static> {
    /// Subscribe to changes with a listener that receives the new value.
    /// The listener is not called with the current value, only with later changes.
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<T>;
}

/// A guard for a subscription to a signal. Dropping it unsubscribes.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct SubscriptionGuard {
    _listenerguard: ListenerGuard,
}

impl SubscriptionGuard {
    pub fn new(guard: ListenerGuard) -> Self { Self { _listenerguard: guard } }

    /// Unsubscribe now. Once this returns the listener is never called again.
    pub fn unsubscribe(self) { drop(self) }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("SubscriptionGuard") }
}

fn subscribe_source<S, T, F>(source: &S, listener: F) -> SubscriptionGuard
where
    S: Source<T>,
    T: 'static,
    F: IntoSubscribeListener<T>,
{
    let listener = listener.into_subscribe_listener();
    SubscriptionGuard::new(source.listen_value(Arc::new(move |value| listener(value))))
}

impl<T> Subscribe<T> for Mut<T>
where T: Clone + Send + Sync + 'static
{
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<T> {
        subscribe_source(self, listener)
    }
}

impl<T> Subscribe<T> for Read<T>
where T: Clone + Send + Sync + 'static
{
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<T> {
        subscribe_source(self, listener)
    }
}

// IntoSubscribeListener implementation for std::sync::mpsc channels
impl<T: Send + 'static> IntoSubscribeListener<T> for std::sync::mpsc::Sender<T> {
    fn into_subscribe_listener(self) -> SubscribeListener<T> {
        Box::new(move |value| {
            let _ = self.send(value);
        })
    }
}

// IntoSubscribeListener implementation for tokio channels
#[cfg(feature = "tokio")]
impl<T: Send + 'static> IntoSubscribeListener<T> for tokio::sync::mpsc::UnboundedSender<T> {
    fn into_subscribe_listener(self) -> SubscribeListener<T> {
        Box::new(move |value| {
            let _ = self.send(value);
        })
    }
}

// Implementations for converting closures to SubscribeListener<T>
impl<F, T> IntoSubscribeListener<T> for F
where F: Fn(T) + Send + Sync + 'static
{
    fn into_subscribe_listener(self) -> SubscribeListener<T> { Box::new(self) }
}
