pub mod mutable;
pub mod read;

pub use mutable::*;
pub use read::*;

use std::any::Any;
use std::sync::Arc;

use crate::broadcast::BroadcastId;
use crate::error::SignalError;

/// Core trait for signals - provides observation capability without regard to a payload value
/// The sole purpose of this trait is to provide a way to listen to changes to a signal.
pub trait Signal {
    /// Listen for change notifications. The listener is removed when the guard is dropped.
    fn listen(&self, listener: Arc<dyn Fn() + Send + Sync>) -> ListenerGuard;

    /// Identity of the broadcast behind this signal. Handles sharing a broadcast share the id.
    fn broadcast_id(&self) -> BroadcastId;
}

/// A signal that carries a value: the upstream of derivations and of the external-store bridge.
///
/// This trait is dyn safe so derived streams can hold any upstream behind an `Arc`.
pub trait Source<T>: Signal + Send + Sync {
    /// Listen for new values, delivered synchronously in registration order
    fn listen_value(&self, listener: Arc<dyn Fn(T) + Send + Sync>) -> ListenerGuard;

    /// Read the current value without side effects
    fn read(&self) -> Result<T, SignalError>;
}

/// Trait for getting the current value of a signal
pub trait Get<T: 'static> {
    fn get(&self) -> T;
}

/// Trait for accessing the current value of a signal with a closure
pub trait With<T: 'static> {
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R;
}

/// Type-erased listener registration. Dropping it unsubscribes.
#[must_use = "dropping the guard unsubscribes immediately"]
pub struct ListenerGuard(Box<dyn Any + Send + Sync>);

impl ListenerGuard {
    pub(crate) fn new<G: Any + Send + Sync>(guard: G) -> Self { Self(Box::new(guard)) }
}

impl std::fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("ListenerGuard") }
}
