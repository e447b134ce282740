use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

/// Identity equality: the same primitive value, or the same shared reference.
///
/// Floats treat NaN as equal to itself and `+0.0` as equal to `-0.0`.
/// Collections do not implement this trait; share nested records behind an `Arc`
/// so they are compared by reference.
pub trait SameValue {
    fn same_value(&self, other: &Self) -> bool;
}

macro_rules! same_value_by_eq {
    ($($ty:ty),* $(,)?) => {
        $(
            impl SameValue for $ty {
                #[inline]
                fn same_value(&self, other: &Self) -> bool { self == other }
            }
        )*
    };
}

same_value_by_eq!(bool, char, (), u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, String, &'static str);

macro_rules! same_value_float {
    ($($ty:ty),*) => {
        $(
            impl SameValue for $ty {
                #[inline]
                fn same_value(&self, other: &Self) -> bool { self == other || (self.is_nan() && other.is_nan()) }
            }
        )*
    };
}

same_value_float!(f32, f64);

impl<T: ?Sized> SameValue for Arc<T> {
    fn same_value(&self, other: &Self) -> bool { Arc::ptr_eq(self, other) }
}

impl<T: SameValue> SameValue for Option<T> {
    fn same_value(&self, other: &Self) -> bool {
        match (self, other) {
            (None, None) => true,
            (Some(a), Some(b)) => a.same_value(b),
            _ => false,
        }
    }
}

/// Returns true when `a` and `b` are the same value under [`SameValue`]
pub fn identity_eq<T: SameValue + ?Sized>(a: &T, b: &T) -> bool { a.same_value(b) }

/// A keyed record whose fields can be enumerated and looked up by key
pub trait Record {
    type Key;
    type Field;

    fn len(&self) -> usize;
    fn is_empty(&self) -> bool { self.len() == 0 }
    fn field(&self, key: &Self::Key) -> Option<&Self::Field>;
    fn fields(&self) -> impl Iterator<Item = (&Self::Key, &Self::Field)>;
}

impl<K: Ord, V> Record for BTreeMap<K, V> {
    type Key = K;
    type Field = V;

    fn len(&self) -> usize { BTreeMap::len(self) }
    fn field(&self, key: &K) -> Option<&V> { self.get(key) }
    fn fields(&self) -> impl Iterator<Item = (&K, &V)> { self.iter() }
}

impl<K: Eq + Hash, V, S: BuildHasher> Record for HashMap<K, V, S> {
    type Key = K;
    type Field = V;

    fn len(&self) -> usize { HashMap::len(self) }
    fn field(&self, key: &K) -> Option<&V> { self.get(key) }
    fn fields(&self) -> impl Iterator<Item = (&K, &V)> { self.iter() }
}

// A shared record is still a record, so `Equality::shallow` works on `Arc`-wrapped fields
impl<R: Record + ?Sized> Record for Arc<R> {
    type Key = R::Key;
    type Field = R::Field;

    fn len(&self) -> usize { (**self).len() }
    fn field(&self, key: &R::Key) -> Option<&R::Field> { (**self).field(key) }
    fn fields(&self) -> impl Iterator<Item = (&R::Key, &R::Field)> { (**self).fields() }
}

/// One-level structural equality: same key set, and [`identity_eq`] for every field.
/// Nested values are never descended into.
pub fn shallow_eq<R>(a: &R, b: &R) -> bool
where
    R: Record,
    R::Field: SameValue,
{
    if std::ptr::eq(a, b) {
        return true;
    }
    a.len() == b.len() && a.fields().all(|(key, value)| b.field(key).is_some_and(|other| value.same_value(other)))
}

/// The gate a cell or derived stream uses to decide whether a new value is a change
pub struct Equality<T>(Arc<dyn Fn(&T, &T) -> bool + Send + Sync>);

impl<T> Clone for Equality<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> std::fmt::Debug for Equality<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str("Equality(..)") }
}

impl<T: 'static> Equality<T> {
    pub fn custom<F>(eq: F) -> Self
    where F: Fn(&T, &T) -> bool + Send + Sync + 'static {
        Self(Arc::new(eq))
    }

    /// Every write is a change
    pub fn never() -> Self { Self::custom(|_, _| false) }

    pub fn is_equal(&self, a: &T, b: &T) -> bool { (self.0)(a, b) }

    /// Lift this gate to optional values: two `None`s are equal, `Some` values compare with `self`
    pub fn optional(self) -> Equality<Option<T>> {
        Equality::custom(move |a: &Option<T>, b: &Option<T>| match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => self.is_equal(a, b),
            _ => false,
        })
    }
}

impl<T: SameValue + 'static> Equality<T> {
    pub fn identity() -> Self { Self::custom(identity_eq::<T>) }
}

impl<T> Equality<T>
where
    T: Record + 'static,
    T::Field: SameValue,
{
    pub fn shallow() -> Self { Self::custom(shallow_eq::<T>) }
}

impl<T: SameValue + 'static> Default for Equality<T> {
    fn default() -> Self { Self::identity() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_identity() {
        assert!(identity_eq(&f64::NAN, &f64::NAN));
        assert!(identity_eq(&0.0f64, &-0.0f64));
        assert!(identity_eq(&f32::NAN, &f32::NAN));
        assert!(!identity_eq(&1.0f64, &2.0f64));
    }

    #[test]
    fn test_arc_is_compared_by_reference() {
        let a = Arc::new(vec![1, 2, 3]);
        let b = Arc::new(vec![1, 2, 3]);
        assert!(identity_eq(&a, &a.clone()));
        assert!(!identity_eq(&a, &b));
    }

    #[test]
    fn test_shallow_eq_records() {
        let a: BTreeMap<&str, i32> = [("a", 1), ("b", 2)].into();
        let b: BTreeMap<&str, i32> = [("b", 2), ("a", 1)].into();
        let c: BTreeMap<&str, i32> = [("a", 1), ("c", 2)].into();
        let d: BTreeMap<&str, i32> = [("a", 1)].into();
        assert!(shallow_eq(&a, &b));
        assert!(!shallow_eq(&a, &c));
        assert!(!shallow_eq(&a, &d));
    }

    #[test]
    fn test_shallow_eq_is_one_level() {
        let inner = Arc::new(BTreeMap::from([("x", 1)]));
        let a: HashMap<&str, Arc<BTreeMap<&str, i32>>> = HashMap::from([("nested", inner.clone())]);
        let same_ref: HashMap<&str, Arc<BTreeMap<&str, i32>>> = HashMap::from([("nested", inner)]);
        let equal_copy: HashMap<&str, Arc<BTreeMap<&str, i32>>> = HashMap::from([("nested", Arc::new(BTreeMap::from([("x", 1)])))]);
        assert!(shallow_eq(&a, &same_ref));
        assert!(!shallow_eq(&a, &equal_copy));
    }

    #[test]
    fn test_shallow_on_shared_records() {
        let shallow = Equality::<Arc<BTreeMap<&str, i32>>>::shallow();
        let a = Arc::new(BTreeMap::from([("x", 1)]));
        assert!(shallow.is_equal(&a, &Arc::new(BTreeMap::from([("x", 1)]))));
        assert!(!shallow.is_equal(&a, &Arc::new(BTreeMap::from([("x", 2)]))));

        let optional = shallow.optional();
        assert!(optional.is_equal(&None, &None));
        assert!(optional.is_equal(&Some(a.clone()), &Some(Arc::new(BTreeMap::from([("x", 1)])))));
        assert!(!optional.is_equal(&Some(a), &None));
    }

    #[test]
    fn test_equality_variants() {
        assert!(Equality::<i32>::identity().is_equal(&1, &1));
        assert!(!Equality::<i32>::never().is_equal(&1, &1));
        let ci = Equality::custom(|a: &String, b: &String| a.eq_ignore_ascii_case(b));
        assert!(ci.is_equal(&"Hi".to_string(), &"hI".to_string()));
    }
}
