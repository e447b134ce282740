use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::{
    Mut, Read,
    broadcast::BroadcastId,
    cache::DeriveCache,
    derived::{Derived, Projection, projection},
    equality::{Equality, SameValue},
    error::SignalError,
    lock,
    porcelain::{IntoSubscribeListener, Subscribe, SubscriptionGuard},
    signal::{Get, ListenerGuard, Signal, Source, With},
};

type FieldProjection<K, V> = Projection<BTreeMap<K, V>, Option<V>>;

/// A reactive keyed record.
///
/// Writes are gated by one-level structural equality, so merging fields that already hold
/// the same values notifies nobody. Per-key views come from [`Store::select`] and only fire
/// when their own field changes, as judged by the store's field equality.
///
/// Cloning a `Store` shares the same record, listeners and field views.
pub struct Store<K, V> {
    cell: Mut<BTreeMap<K, V>>,
    cache: DeriveCache,
    field_equality: Equality<Option<V>>,
    // One projection per key, so repeated selects resolve to the same cache entry.
    // Pruned on select once no field view holds the projection anymore.
    selectors: Arc<Mutex<BTreeMap<K, FieldProjection<K, V>>>>,
}

impl<K, V> Clone for Store<K, V> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            cache: self.cache.clone(),
            field_equality: self.field_equality.clone(),
            selectors: self.selectors.clone(),
        }
    }
}

impl<K, V> Store<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: SameValue + Clone + Send + Sync + 'static,
{
    /// Create a store whose field views live in the process-wide [`DeriveCache`]
    pub fn new(record: impl IntoIterator<Item = (K, V)>) -> Self { Self::with_cache(record, DeriveCache::global()) }

    pub fn with_cache(record: impl IntoIterator<Item = (K, V)>, cache: DeriveCache) -> Self {
        Self::with_field_equality(record, cache, Equality::identity())
    }

    /// Create a store whose field views re-notify only when `equality` says a field changed.
    ///
    /// Use [`Equality::shallow`] for `Arc`-wrapped record fields, so a field replaced by a new
    /// record with the same contents stays quiet.
    pub fn with_field_equality(record: impl IntoIterator<Item = (K, V)>, cache: DeriveCache, equality: Equality<V>) -> Self {
        Self {
            cell: Mut::with_equality(record.into_iter().collect(), Equality::shallow()),
            cache,
            field_equality: equality.optional(),
            selectors: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Shallow merge: the given fields are overwritten, every other field keeps its value.
    /// Returns whether listeners were notified.
    pub fn set_fields(&self, fields: impl IntoIterator<Item = (K, V)>) -> bool {
        self.cell.update(move |record| {
            let mut next = record.clone();
            next.extend(fields);
            next
        })
    }

    /// Set a single field
    pub fn set_field(&self, key: K, value: V) -> bool { self.set_fields([(key, value)]) }

    /// Replace the whole record with a function of the previous one
    pub fn replace<F>(&self, f: F) -> bool
    where F: FnOnce(&BTreeMap<K, V>) -> BTreeMap<K, V> {
        self.cell.update(f)
    }

    /// Replace the whole record
    pub fn set(&self, record: BTreeMap<K, V>) -> bool { self.cell.set(record) }

    /// Current value of one field
    pub fn field(&self, key: &K) -> Option<V> { self.cell.with(|record| record.get(key).cloned()) }

    /// A view of one field that only notifies when that field changes.
    ///
    /// Views are requested through the store's [`DeriveCache`], so selecting the same key twice
    /// returns the same stream for as long as it is held.
    pub fn select(&self, key: &K) -> Derived<Option<V>> {
        let field_projection = {
            let mut selectors = lock::lock(&self.selectors);
            // A live view holds a clone of its projection; the rest can be rebuilt on demand
            selectors.retain(|_, projection| Arc::strong_count(projection) > 1);
            selectors
                .entry(key.clone())
                .or_insert_with(|| {
                    let key = key.clone();
                    projection(move |record: &BTreeMap<K, V>| record.get(&key).cloned())
                })
                .clone()
        };
        self.cache.get_or_create_with(&self.cell.read(), &field_projection, self.field_equality.clone())
    }

    /// Read-only handle to the whole record
    pub fn read(&self) -> Read<BTreeMap<K, V>> { self.cell.read() }

    /// Number of listeners on the whole record, field views included
    pub fn subscriber_count(&self) -> usize { self.cell.subscriber_count() }
}

impl<K, V> Get<BTreeMap<K, V>> for Store<K, V>
where
    K: Clone + 'static,
    V: Clone + 'static,
{
    fn get(&self) -> BTreeMap<K, V> { self.cell.get() }
}

impl<K: 'static, V: 'static> With<BTreeMap<K, V>> for Store<K, V> {
    fn with<R>(&self, f: impl FnOnce(&BTreeMap<K, V>) -> R) -> R { self.cell.with(f) }
}

impl<K: 'static, V: 'static> Signal for Store<K, V> {
    fn listen(&self, listener: Arc<dyn Fn() + Send + Sync>) -> ListenerGuard { self.cell.listen(listener) }

    fn broadcast_id(&self) -> BroadcastId { self.cell.broadcast_id() }
}

impl<K, V> Source<BTreeMap<K, V>> for Store<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn listen_value(&self, listener: Arc<dyn Fn(BTreeMap<K, V>) + Send + Sync>) -> ListenerGuard { self.cell.listen_value(listener) }

    fn read(&self) -> Result<BTreeMap<K, V>, SignalError> { Source::read(&self.cell) }
}

impl<K, V> Subscribe<BTreeMap<K, V>> for Store<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn subscribe<F>(&self, listener: F) -> SubscriptionGuard
    where F: IntoSubscribeListener<BTreeMap<K, V>> {
        self.cell.subscribe(listener)
    }
}

impl<K: std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for Store<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("Store").field("cell", &self.cell).finish() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> Store<&'static str, i64> { Store::with_cache([("a", 1), ("b", 2)], DeriveCache::new(CacheConfig::default())) }

    #[test]
    fn test_merge_keeps_other_fields() {
        let store = store();
        assert!(store.set_fields([("a", 10)]));
        assert_eq!(store.get(), BTreeMap::from([("a", 10), ("b", 2)]));
        assert!(store.set_field("c", 3));
        assert_eq!(store.field(&"c"), Some(3));
    }

    #[test]
    fn test_identical_merge_is_gated() {
        let store = store();
        let count = Arc::new(AtomicUsize::new(0));
        let _guard = {
            let count = count.clone();
            store.subscribe(move |_: BTreeMap<&'static str, i64>| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        assert!(!store.set_fields([("a", 1)]));
        assert!(!store.replace(|record| record.clone()));
        assert!(store.replace(|_| BTreeMap::from([("z", 0)])));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_select_missing_key() {
        let store = store();
        let missing = store.select(&"nope");
        assert_eq!(missing.try_get(), Ok(None));
        store.set_field("nope", 7);
        assert_eq!(missing.try_get(), Ok(Some(7)));
    }

    #[test]
    fn test_unused_selectors_are_pruned() {
        let store = store();
        let a = store.select(&"a");
        let b = store.select(&"b");
        drop(a);
        let _c = store.select(&"c");

        let selectors = lock::lock(&store.selectors);
        assert_eq!(selectors.keys().copied().collect::<Vec<_>>(), vec!["b", "c"]);
        drop(selectors);
        // Still the same view for a held key
        assert!(store.select(&"b").ptr_eq(&b));
    }

    #[test]
    fn test_field_views_share_one_upstream_listener() {
        let store = store();
        let a = store.select(&"a");
        let b = store.select(&"b");
        let _ga = a.subscribe(|_: Option<i64>| {});
        let _ga2 = store.select(&"a").subscribe(|_: Option<i64>| {});
        let _gb = b.subscribe(|_: Option<i64>| {});
        // One upstream listener per distinct key
        assert_eq!(store.subscriber_count(), 2);
        assert_eq!(a.subscriber_count(), 2);
    }
}
