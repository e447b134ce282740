use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use crate::{
    broadcast::Broadcast,
    error::{SignalError, panic_message},
    lock,
    signal::{ListenerGuard, Source},
};

type Predicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Options for an [`ExternalStore`]
pub struct BridgeOptions<T> {
    continue_while: Option<Predicate<T>>,
    debounce: Option<Duration>,
}

impl<T> Default for BridgeOptions<T> {
    fn default() -> Self { Self { continue_while: None, debounce: None } }
}

impl<T> Clone for BridgeOptions<T> {
    fn clone(&self) -> Self { Self { continue_while: self.continue_while.clone(), debounce: self.debounce } }
}

impl<T> BridgeOptions<T> {
    pub fn new() -> Self { Self::default() }

    /// Keep propagating while `predicate` holds.
    ///
    /// The first value that fails the predicate is still delivered, after which the bridge
    /// releases its source for good. A predicate that panics counts as failing.
    pub fn continue_while<F>(mut self, predicate: F) -> Self
    where F: Fn(&T) -> bool + Send + Sync + 'static {
        self.continue_while = Some(Arc::new(predicate));
        self
    }

    /// Deliver only the last value of every burst.
    ///
    /// The timer restarts on each incoming value, so a value is delivered once the source has
    /// been quiet for `window`. Timers run on the ambient tokio runtime; with no runtime (or
    /// without the `tokio` feature) values are delivered immediately.
    pub fn debounce(mut self, window: Duration) -> Self {
        self.debounce = Some(window);
        self
    }
}

impl<T> std::fmt::Debug for BridgeOptions<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeOptions").field("continue_while", &self.continue_while.is_some()).field("debounce", &self.debounce).finish()
    }
}

#[cfg(feature = "tokio")]
struct Pending<T> {
    value: Option<T>,
    timer: Option<tokio::task::AbortHandle>,
    // Bumped on every schedule so a timer that already fired cannot flush a newer value
    generation: u64,
}

struct Inner<T> {
    this: Weak<Self>,
    source: Arc<dyn Source<T>>,
    options: BridgeOptions<T>,
    snapshot: RwLock<T>,
    server_snapshot: T,
    version: AtomicUsize,
    /// Fan-out to every `on_change` callback
    notify: Broadcast<()>,
    /// One subscription to the source, shared by all callbacks
    upstream: Mutex<Option<ListenerGuard>>,
    consumers: AtomicUsize,
    latched: AtomicBool,
    #[cfg(feature = "tokio")]
    pending: Mutex<Pending<T>>,
}

/// Adapts a push-based source to the `subscribe` / `get_snapshot` pair a pull-based renderer
/// polls, without tearing.
///
/// The snapshot only moves when a change is announced to the `on_change` callbacks, so a
/// renderer never reads a value ahead of the notification it is reacting to. All callbacks
/// share one subscription to the source: it is taken by the first [`ExternalStore::subscribe`]
/// and released when the last [`Unsubscribe`] runs.
///
/// Cloning an `ExternalStore` shares the same snapshot and callbacks.
pub struct ExternalStore<T>(Arc<Inner<T>>);

impl<T> Clone for ExternalStore<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> ExternalStore<T>
where T: Clone + Send + Sync + 'static
{
    /// Bridge `source`. `initial` is the snapshot until the first change and the server snapshot.
    pub fn new<S>(source: S, initial: T) -> Self
    where S: Source<T> + 'static {
        Self::with_options(source, initial, BridgeOptions::default())
    }

    pub fn with_options<S>(source: S, initial: T, options: BridgeOptions<T>) -> Self
    where S: Source<T> + 'static {
        #[cfg(not(feature = "tokio"))]
        if options.debounce.is_some() {
            tracing::warn!("bridge debounce needs the `tokio` feature, values will be delivered immediately");
        }

        Self(Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            source: Arc::new(source),
            options,
            snapshot: RwLock::new(initial.clone()),
            server_snapshot: initial,
            version: AtomicUsize::new(0),
            notify: Broadcast::new(),
            upstream: Mutex::new(None),
            consumers: AtomicUsize::new(0),
            latched: AtomicBool::new(false),
            #[cfg(feature = "tokio")]
            pending: Mutex::new(Pending { value: None, timer: None, generation: 0 }),
        }))
    }

    /// Bridge `source`, using its current value as the initial snapshot
    pub fn from_source<S>(source: S, options: BridgeOptions<T>) -> Result<Self, SignalError>
    where S: Source<T> + 'static {
        let initial = source.read()?;
        Ok(Self::with_options(source, initial, options))
    }

    /// Register `on_change`, called with no arguments after every announced change.
    ///
    /// The subscription that attaches the bridge refreshes the snapshot with one synchronous
    /// read of the source before returning; a failed read keeps the last known-good snapshot.
    /// Later subscriptions share the attached snapshot, which only moves on announcements.
    pub fn subscribe<F>(&self, on_change: F) -> Unsubscribe
    where F: Fn() + Send + Sync + 'static {
        let listener: Arc<dyn Fn() + Send + Sync> = Arc::new(on_change);
        let guard = self.0.notify.reference().listen(listener);
        if self.0.consumers.fetch_add(1, Ordering::SeqCst) == 0 {
            self.0.attach();
            self.0.seed();
        }

        let inner = self.0.clone();
        Unsubscribe(Mutex::new(Some(Box::new(move || {
            drop(guard);
            inner.release();
        }))))
    }
}

impl<T: Clone> ExternalStore<T> {
    /// The value as of the last announced change, or the initial value
    pub fn get_snapshot(&self) -> T { lock::read(&self.0.snapshot).clone() }

    /// The value to render when no live source is available: the initial value
    pub fn get_server_snapshot(&self) -> T { self.0.server_snapshot.clone() }

    /// Number of changes announced so far
    pub fn version(&self) -> usize { self.0.version.load(Ordering::SeqCst) }

    /// Number of live `on_change` callbacks
    pub fn subscriber_count(&self) -> usize { self.0.consumers.load(Ordering::SeqCst) }

    /// Whether the bridge currently holds a subscription to its source
    pub fn is_attached(&self) -> bool { lock::lock(&self.0.upstream).is_some() }

    /// Whether the continuation predicate has failed. A latched bridge never propagates again.
    pub fn is_latched(&self) -> bool { self.0.latched.load(Ordering::SeqCst) }
}

impl<T> Inner<T>
where T: Clone + Send + Sync + 'static
{
    fn attach(&self) {
        if self.latched.load(Ordering::SeqCst) {
            return;
        }
        let weak = self.this.clone();
        let guard = self.source.listen_value(Arc::new(move |value: T| {
            if let Some(inner) = weak.upgrade() {
                inner.receive(value);
            }
        }));
        *lock::lock(&self.upstream) = Some(guard);
        tracing::debug!("bridge {} attached to source {}", self.notify.id(), self.source.broadcast_id());
    }

    fn seed(&self) {
        if self.latched.load(Ordering::SeqCst) {
            return;
        }
        match self.source.read() {
            Ok(value) => {
                let keep_going = self.should_continue(&value);
                *lock::write(&self.snapshot) = value;
                if !keep_going {
                    let _ = self.latch();
                }
            }
            Err(error) => tracing::warn!("bridge {} kept its last snapshot, source read failed: {}", self.notify.id(), error),
        }
    }

    fn receive(&self, value: T) {
        if self.latched.load(Ordering::SeqCst) {
            return;
        }
        // Latch before delivering, so a set made by an `on_change` callback is not propagated
        if !self.should_continue(&value) && !self.latch() {
            return;
        }
        self.deliver(value);
    }

    fn should_continue(&self, value: &T) -> bool {
        let Some(predicate) = &self.options.continue_while else {
            return true;
        };
        catch_unwind(AssertUnwindSafe(|| predicate(value))).unwrap_or_else(|payload| {
            tracing::warn!("bridge {} continuation predicate panicked: {}", self.notify.id(), panic_message(&*payload));
            false
        })
    }

    /// Returns false when the bridge was already latched
    fn latch(&self) -> bool {
        if self.latched.swap(true, Ordering::SeqCst) {
            return false;
        }
        let upstream = lock::lock(&self.upstream).take();
        drop(upstream);
        tracing::debug!("bridge {} latched, released source {}", self.notify.id(), self.source.broadcast_id());
        true
    }

    #[cfg(feature = "tokio")]
    fn deliver(&self, value: T) {
        match self.options.debounce {
            Some(window) => self.schedule(value, window),
            None => self.announce(value),
        }
    }

    #[cfg(not(feature = "tokio"))]
    fn deliver(&self, value: T) { self.announce(value) }

    #[cfg(feature = "tokio")]
    fn schedule(&self, value: T, window: Duration) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("bridge {} has no tokio runtime for its debounce timer, delivering immediately", self.notify.id());
            self.announce(value);
            return;
        };

        let mut pending = lock::lock(&self.pending);
        pending.value = Some(value);
        pending.generation += 1;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }

        let generation = pending.generation;
        let weak = self.this.clone();
        let task = runtime.spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = weak.upgrade() {
                inner.flush(generation);
            }
        });
        pending.timer = Some(task.abort_handle());
    }

    #[cfg(feature = "tokio")]
    fn flush(&self, generation: u64) {
        let value = {
            let mut pending = lock::lock(&self.pending);
            if pending.generation != generation {
                return;
            }
            pending.timer = None;
            pending.value.take()
        };
        if let Some(value) = value {
            self.announce(value);
        }
    }

    #[cfg(feature = "tokio")]
    fn cancel_timer(&self) {
        let mut pending = lock::lock(&self.pending);
        pending.value = None;
        pending.generation += 1;
        if let Some(timer) = pending.timer.take() {
            timer.abort();
        }
    }

    fn announce(&self, value: T) {
        // The snapshot moves before the callbacks run, so they re-read what was announced
        *lock::write(&self.snapshot) = value;
        self.version.fetch_add(1, Ordering::SeqCst);
        self.notify.send(());
    }

    fn release(&self) {
        if self.consumers.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let upstream = lock::lock(&self.upstream).take();
        if upstream.is_some() {
            tracing::debug!("bridge {} detached from source {}", self.notify.id(), self.source.broadcast_id());
        }
        drop(upstream);
        #[cfg(feature = "tokio")]
        self.cancel_timer();
    }
}

impl<T: Clone + std::fmt::Debug> std::fmt::Debug for ExternalStore<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExternalStore")
            .field("snapshot", &self.get_snapshot())
            .field("version", &self.version())
            .field("subscribers", &self.subscriber_count())
            .field("latched", &self.is_latched())
            .finish()
    }
}

/// Returned by [`ExternalStore::subscribe`].
///
/// [`Unsubscribe::unsubscribe`] may be called any number of times; only the first call has an
/// effect. Dropping the handle unsubscribes too.
#[must_use = "dropping the handle unsubscribes immediately"]
pub struct Unsubscribe(Mutex<Option<Box<dyn FnOnce() + Send>>>);

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        // Take under the lock, run outside it
        let release = lock::lock(&self.0).take();
        if let Some(release) = release {
            release();
        }
    }

    /// Whether this handle still holds its subscription
    pub fn is_active(&self) -> bool { lock::lock(&self.0).is_some() }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) { self.unsubscribe(); }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_tuple("Unsubscribe").field(&self.is_active()).finish() }
}
