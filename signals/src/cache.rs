use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::{
    broadcast::BroadcastId,
    derived::{Derived, DerivedNode, Projection, projection_id},
    equality::{Equality, SameValue},
    lock,
    signal::Source,
};

/// Default bound on the number of indexed derivations
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// Configuration for a [`DeriveCache`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Entries beyond this bound are evicted least-recently-used first, skipping any entry
    /// that still has live subscribers.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self { Self { capacity: DEFAULT_CACHE_CAPACITY } }
}

impl CacheConfig {
    pub fn with_capacity(capacity: usize) -> Self { Self { capacity } }
}

/// The type-erased view of a derived stream that the cache indexes
pub(crate) trait CacheSlot: Send + Sync {
    fn consumers(&self) -> usize;
    fn is_terminated(&self) -> bool;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct CacheKey {
    source: BroadcastId,
    projection: usize,
}

struct Entry {
    // Weak: the cache indexes streams, their subscribers own them
    slot: Weak<dyn CacheSlot>,
    last_access: u64,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, Entry>,
    tick: u64,
}

struct Inner {
    config: CacheConfig,
    state: Mutex<State>,
}

/// Deduplicates derived streams by (source, projection) identity.
///
/// Two requests with the same source and the same [`Projection`] allocation return the same
/// [`Derived`] for as long as someone holds it, so independent consumers share one upstream
/// subscription. The cache never keeps a stream alive by itself.
///
/// Construct independent caches with [`DeriveCache::new`], or share the process-wide one from
/// [`DeriveCache::global`]. Cloning shares the same cache.
#[derive(Clone)]
pub struct DeriveCache(Arc<Inner>);

static GLOBAL: OnceLock<DeriveCache> = OnceLock::new();

impl Default for DeriveCache {
    fn default() -> Self { Self::new(CacheConfig::default()) }
}

impl DeriveCache {
    pub fn new(config: CacheConfig) -> Self { Self(Arc::new(Inner { config, state: Mutex::new(State::default()) })) }

    /// The process-wide cache, created with the default configuration on first use
    pub fn global() -> DeriveCache { GLOBAL.get_or_init(DeriveCache::default).clone() }

    pub fn config(&self) -> CacheConfig { self.0.config }

    /// Return the derivation of `source` by `projection`, gated by identity equality
    pub fn get_or_create<S, T, U>(&self, source: &S, projection: &Projection<T, U>) -> Derived<U>
    where
        S: Source<T> + Clone + 'static,
        T: Send + Sync + 'static,
        U: SameValue + Clone + Send + Sync + 'static,
    {
        self.get_or_create_with(source, projection, Equality::identity())
    }

    /// Return the derivation of `source` by `projection`.
    ///
    /// `equality` only applies when this call creates the stream; a cached stream keeps the
    /// gate it was created with.
    pub fn get_or_create_with<S, T, U>(&self, source: &S, projection: &Projection<T, U>, equality: Equality<U>) -> Derived<U>
    where
        S: Source<T> + Clone + 'static,
        T: Send + Sync + 'static,
        U: Clone + Send + Sync + 'static,
    {
        let key = CacheKey { source: source.broadcast_id(), projection: projection_id(projection) };

        // Lookup and insertion happen under one lock and run no user code, so two racing
        // first requests resolve to a single stream.
        let mut state = lock::lock(&self.0.state);
        state.tick += 1;
        let tick = state.tick;

        if let Some(entry) = state.entries.get_mut(&key) {
            if let Some(node) = entry.slot.upgrade().filter(|slot| !slot.is_terminated()).and_then(downcast::<T, U>) {
                entry.last_access = tick;
                return Derived::from_node(node);
            }
        }

        let node = DerivedNode::new(Arc::new(source.clone()), projection.clone(), equality);
        let slot: Arc<dyn CacheSlot> = node.clone();
        state.entries.insert(key, Entry { slot: Arc::downgrade(&slot), last_access: tick });
        tracing::debug!("derive cache: created derivation of source {} ({} entries)", key.source, state.entries.len());

        if state.entries.len() > self.0.config.capacity {
            state.evict(self.0.config.capacity, &key);
        }
        Derived::from_node(node)
    }

    /// Number of indexed entries, including ones whose stream has been dropped but not yet pruned
    pub fn len(&self) -> usize { lock::lock(&self.0.state).entries.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Drop every index entry. Streams that are still held keep working.
    pub fn clear(&self) { lock::lock(&self.0.state).entries.clear(); }
}

fn downcast<T, U>(slot: Arc<dyn CacheSlot>) -> Option<Arc<DerivedNode<T, U>>>
where
    T: Send + Sync + 'static,
    U: Clone + Send + Sync + 'static,
{
    slot.into_any().downcast::<DerivedNode<T, U>>().ok()
}

impl State {
    fn evict(&mut self, capacity: usize, keep: &CacheKey) {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.slot.strong_count() > 0);

        while self.entries.len() > capacity {
            // Entries with live subscribers are only released by their subscribers
            let victim = self
                .entries
                .iter()
                .filter(|(key, entry)| *key != keep && entry.slot.upgrade().is_some_and(|slot| slot.consumers() == 0))
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| *key);

            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
        tracing::debug!("derive cache: evicted {} entries, {} remain", before - self.entries.len(), self.entries.len());
    }
}

impl std::fmt::Debug for DeriveCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeriveCache").field("config", &self.0.config).field("entries", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Mut, Subscribe, projection};

    #[test]
    fn test_same_key_same_stream() {
        let cache = DeriveCache::new(CacheConfig::default());
        let source = Mut::new(1);
        let double = projection(|value: &i32| value * 2);

        let a = cache.get_or_create(&source, &double);
        let b = cache.get_or_create(&source.read(), &double);
        assert!(a.ptr_eq(&b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_distinct_projection_allocations_are_distinct() {
        let cache = DeriveCache::new(CacheConfig::default());
        let source = Mut::new(1);
        let a = cache.get_or_create(&source, &projection(|value: &i32| value * 2));
        let b = cache.get_or_create(&source, &projection(|value: &i32| value * 2));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn test_dropped_stream_is_recreated() {
        let cache = DeriveCache::new(CacheConfig::default());
        let source = Mut::new(1);
        let double = projection(|value: &i32| value * 2);

        let first = cache.get_or_create(&source, &double);
        let weak_count = cache.len();
        drop(first);
        let second = cache.get_or_create(&source, &double);
        assert_eq!(weak_count, 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(second.try_get(), Ok(2));
    }

    #[test]
    fn test_eviction_skips_live_entries() {
        let cache = DeriveCache::new(CacheConfig::with_capacity(2));
        let source = Mut::new(1);

        let live_projection = projection(|value: &i32| value + 100);
        let live = cache.get_or_create(&source, &live_projection);
        let _guard = live.subscribe(|_: i32| {});

        // Held but unsubscribed: eligible for eviction
        let idle: Vec<_> = (0..3)
            .map(|i| {
                let p = projection(move |value: &i32| value + i);
                (cache.get_or_create(&source, &p), p)
            })
            .collect();

        assert_eq!(cache.len(), 2);
        assert!(cache.get_or_create(&source, &live_projection).ptr_eq(&live));
        // The most recent idle entry survives
        let (last, last_projection) = idle.last().unwrap();
        assert!(cache.get_or_create(&source, last_projection).ptr_eq(last));
    }

    #[test]
    fn test_terminated_stream_is_replaced() {
        let cache = DeriveCache::new(CacheConfig::default());
        let source = Mut::new(0);
        let fragile = projection(|value: &i32| {
            if *value > 0 {
                panic!("too big");
            }
            *value
        });

        let first = cache.get_or_create(&source, &fragile);
        let _guard = first.subscribe(|_: i32| {});
        source.set(1);
        assert!(first.failure().is_some());

        source.set(0);
        let second = cache.get_or_create(&source, &fragile);
        assert!(!second.ptr_eq(&first));
        assert_eq!(second.try_get(), Ok(0));
    }

    #[test]
    fn test_global_is_shared() {
        let source = Mut::new(3);
        let triple = projection(|value: &i32| value * 3);
        let a = DeriveCache::global().get_or_create(&source, &triple);
        let b = DeriveCache::global().get_or_create(&source, &triple);
        assert!(a.ptr_eq(&b));
    }
}
