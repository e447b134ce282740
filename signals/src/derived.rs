use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use crate::{
    broadcast::{Broadcast, BroadcastId},
    cache::CacheSlot,
    equality::Equality,
    error::{SignalError, panic_message},
    lock,
    porcelain::{IntoSubscribeListener, Subscribe, SubscriptionGuard},
    signal::{ListenerGuard, Signal, Source},
};

/// A projection from a source value to a derived value.
///
/// Identity is the `Arc` allocation: clone the same `Projection` to request the same derivation
/// again. Two separately constructed closures are always different derivations, even when they
/// compute the same thing.
pub type Projection<T, U> = Arc<dyn Fn(&T) -> U + Send + Sync>;

/// Wrap a closure as a [`Projection`]
pub fn projection<T, U, F>(f: F) -> Projection<T, U>
where F: Fn(&T) -> U + Send + Sync + 'static {
    Arc::new(f)
}

pub(crate) fn projection_id<T, U>(projection: &Projection<T, U>) -> usize { Arc::as_ptr(projection) as *const () as usize }

/// The type-erased side of a derived stream that its handles and guards talk to
pub(crate) trait Node<U>: Send + Sync {
    fn values(&self) -> &Broadcast<U>;
    fn errors(&self) -> &Broadcast<SignalError>;
    fn acquire(&self);
    fn release(&self);
    fn consumers(&self) -> usize;
    fn is_attached(&self) -> bool;
    fn failure(&self) -> Option<SignalError>;
    fn read(&self) -> Result<U, SignalError>;
}

pub(crate) struct DerivedNode<T, U> {
    this: Weak<Self>,
    source: Arc<dyn Source<T>>,
    projection: Projection<T, U>,
    equality: Equality<U>,
    /// Last projected value; the gate for re-notification while attached
    cached: RwLock<Option<U>>,
    values: Broadcast<U>,
    errors: Broadcast<SignalError>,
    /// Present only while at least one consumer is subscribed
    upstream: Mutex<Option<ListenerGuard>>,
    consumers: AtomicUsize,
    /// Set once a projection fails; the stream never attaches again
    failure: RwLock<Option<SignalError>>,
}

impl<T, U> DerivedNode<T, U>
where
    T: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    /// Creates a detached node. Nothing is evaluated until the first consumer subscribes.
    pub(crate) fn new(source: Arc<dyn Source<T>>, projection: Projection<T, U>, equality: Equality<U>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            source,
            projection,
            equality,
            cached: RwLock::new(None),
            values: Broadcast::new(),
            errors: Broadcast::new(),
            upstream: Mutex::new(None),
            consumers: AtomicUsize::new(0),
            failure: RwLock::new(None),
        })
    }

    fn compute(&self, input: &T) -> Result<U, SignalError> {
        catch_unwind(AssertUnwindSafe(|| (self.projection)(input)))
            .map_err(|payload| SignalError::ProjectionPanicked { message: panic_message(&*payload) })
    }

    fn attach(&self) {
        if self.failure().is_some() {
            return;
        }

        // Listen before reading so a change between the two is never missed
        let weak = self.this.clone();
        let guard = self.source.listen_value(Arc::new(move |value: T| {
            if let Some(node) = weak.upgrade() {
                node.recompute(&value);
            }
        }));
        *lock::lock(&self.upstream) = Some(guard);
        tracing::debug!("derived stream {} attached to source {}", self.values.id(), self.source.broadcast_id());

        match self.source.read().and_then(|value| self.compute(&value)) {
            Ok(value) => *lock::write(&self.cached) = Some(value),
            Err(error) => self.fail(error),
        }
    }

    fn recompute(&self, input: &T) {
        if self.failure().is_some() {
            return;
        }
        match self.compute(input) {
            Ok(next) => {
                // The gate is user code: compare against a copy so it may read this stream
                let previous = lock::read(&self.cached).clone();
                if previous.is_some_and(|previous| self.equality.is_equal(&previous, &next)) {
                    return;
                }
                *lock::write(&self.cached) = Some(next.clone());
                self.values.send(next);
            }
            Err(error) => self.fail(error),
        }
    }

    fn fail(&self, error: SignalError) {
        {
            let mut failure = lock::write(&self.failure);
            if failure.is_some() {
                return;
            }
            *failure = Some(error.clone());
        }
        let upstream = lock::lock(&self.upstream).take();
        drop(upstream);
        tracing::warn!("derived stream {} terminated: {}", self.values.id(), error);
        self.errors.send(error);
    }
}

impl<T, U> Node<U> for DerivedNode<T, U>
where
    T: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    fn values(&self) -> &Broadcast<U> { &self.values }

    fn errors(&self) -> &Broadcast<SignalError> { &self.errors }

    fn acquire(&self) {
        if self.consumers.fetch_add(1, Ordering::SeqCst) == 0 {
            self.attach();
        }
    }

    fn release(&self) {
        if self.consumers.fetch_sub(1, Ordering::SeqCst) == 1 {
            let upstream = lock::lock(&self.upstream).take();
            if upstream.is_some() {
                tracing::debug!("derived stream {} detached from source {}", self.values.id(), self.source.broadcast_id());
            }
        }
    }

    fn consumers(&self) -> usize { self.consumers.load(Ordering::SeqCst) }

    fn is_attached(&self) -> bool { lock::lock(&self.upstream).is_some() }

    fn failure(&self) -> Option<SignalError> { lock::read(&self.failure).clone() }

    fn read(&self) -> Result<U, SignalError> {
        if self.failure().is_some() {
            // The last good value stays readable after termination
            return lock::read(&self.cached).clone().ok_or(SignalError::Terminated);
        }
        if self.is_attached() {
            if let Some(value) = lock::read(&self.cached).clone() {
                return Ok(value);
            }
        }
        // Detached: evaluate on demand without attaching
        let input = self.source.read()?;
        self.compute(&input)
    }
}

impl<T, U> CacheSlot for DerivedNode<T, U>
where
    T: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    fn consumers(&self) -> usize { <Self as Node<U>>::consumers(self) }

    fn is_terminated(&self) -> bool { <Self as Node<U>>::failure(self).is_some() }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> { self }
}

/// Releases one consumer reference when dropped
struct Attachment<U>(Arc<dyn Node<U>>);

impl<U> Drop for Attachment<U> {
    fn drop(&mut self) { self.0.release(); }
}

/// A read-only value computed from a source by a projection.
///
/// Derived streams are lazy and reference counted: the first subscriber attaches a single
/// listener to the source, and dropping the last subscription releases it. While detached,
/// [`Derived::try_get`] evaluates the projection on demand.
///
/// The stream re-notifies only when its own [`Equality`] says the projected value changed.
/// A panic inside the projection terminates the stream: the error is sent to
/// [`Derived::subscribe_errors`] listeners, the source is released, and the last good value
/// remains readable. The source and other derivations are not affected.
///
/// Request derived streams from a [`crate::DeriveCache`] so that identical requests share one
/// stream. Cloning a `Derived` shares the same stream.
pub struct Derived<U>(Arc<dyn Node<U>>);

impl<U> Clone for Derived<U> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<U> Derived<U>
where U: Clone + Send + Sync + 'static
{
    pub(crate) fn from_node<T: Send + Sync + 'static>(node: Arc<DerivedNode<T, U>>) -> Self { Self(node) }

    /// Current value: cached while attached, computed on demand otherwise
    pub fn try_get(&self) -> Result<U, SignalError> { self.0.read() }

    /// Listen for projection failures
    pub fn subscribe_errors<F>(&self, listener: F) -> SubscriptionGuard
    where F: Fn(SignalError) + Send + Sync + 'static {
        let guard = self.0.errors().reference().listen(listener);
        SubscriptionGuard::new(self.attach_guard(guard))
    }

    /// Number of live consumers (value, error and notify listeners, including downstream derivations)
    pub fn subscriber_count(&self) -> usize { self.0.consumers() }

    /// Whether the stream currently holds a subscription to its source
    pub fn is_attached(&self) -> bool { self.0.is_attached() }

    /// The error that terminated this stream, if any
    pub fn failure(&self) -> Option<SignalError> { self.0.failure() }

    /// Whether both handles refer to the same stream
    pub fn ptr_eq(&self, other: &Self) -> bool { std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0)) }

    fn attach_guard<G: Any + Send + Sync>(&self, guard: G) -> ListenerGuard {
        self.0.acquire();
        // Tuple fields drop in order: the listener goes away before the consumer is released
        ListenerGuard::new((guard, Attachment(self.0.clone())))
    }
}

impl<U> Signal for Derived<U>
where U: Clone + Send + Sync + 'static
{
    fn listen(&self, listener: Arc<dyn Fn() + Send + Sync>) -> ListenerGuard {
        let guard = self.0.values().reference().listen(listener);
        self.attach_guard(guard)
    }

    fn broadcast_id(&self) -> BroadcastId { self.0.values().id() }
}

impl<U> Source<U> for Derived<U>
where U: Clone + Send + Sync + 'static
{
    fn listen_value(&self, listener: Arc<dyn Fn(U) + Send + Sync>) -> ListenerGuard {
        let guard = self.0.values().reference().listen(listener);
        self.attach_guard(guard)
    }

    fn read(&self) -> Result<U, SignalError> { self.0.read() }
}

impl<U> Subscribe<U> for Derived<U>
where U: Clone + Send + Sync + 'static
{
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<U> {
        let listener = listener.into_subscribe_listener();
        SubscriptionGuard::new(self.listen_value(Arc::new(move |value| listener(value))))
    }
}

impl<U> std::fmt::Debug for Derived<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Derived")
            .field("id", &self.0.values().id())
            .field("consumers", &self.0.consumers())
            .field("attached", &self.0.is_attached())
            .finish()
    }
}
