use std::sync::Arc;

use crate::{
    broadcast::{Broadcast, BroadcastId},
    error::SignalError,
    signal::{Get, ListenerGuard, Signal, Source, With},
    value::ValueCell,
};

/// Read-only signal
pub struct Read<T> {
    pub(crate) value: ValueCell<T>,
    pub(crate) broadcast: Broadcast<T>,
}

impl<T> Clone for Read<T> {
    fn clone(&self) -> Self { Self { value: self.value.clone(), broadcast: self.broadcast.clone() } }
}

impl<T: 'static> With<T> for Read<T> {
    fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R { self.value.with(f) }
}

impl<T: Clone + 'static> Get<T> for Read<T> {
    fn get(&self) -> T { self.value.value() }
}

impl<T: 'static> Signal for Read<T> {
    fn listen(&self, listener: Arc<dyn Fn() + Send + Sync>) -> ListenerGuard { ListenerGuard::new(self.broadcast.reference().listen(listener)) }

    fn broadcast_id(&self) -> BroadcastId { self.broadcast.id() }
}

impl<T> Source<T> for Read<T>
where T: Clone + Send + Sync + 'static
{
    fn listen_value(&self, listener: Arc<dyn Fn(T) + Send + Sync>) -> ListenerGuard {
        ListenerGuard::new(self.broadcast.reference().listen(listener))
    }

    fn read(&self) -> Result<T, SignalError> { Ok(self.value.value()) }
}

impl<T: std::fmt::Display> std::fmt::Display for Read<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { self.value.with(|v| write!(f, "{}", v)) }
}
