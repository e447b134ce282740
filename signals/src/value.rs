use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use crate::error::panic_message;
use crate::lock::{read, write};

pub(crate) struct ValueCell<T>(Arc<RwLock<T>>);

impl<T> Clone for ValueCell<T> {
    fn clone(&self) -> Self { Self(self.0.clone()) }
}

impl<T> ValueCell<T> {
    pub fn new(value: T) -> Self { Self(Arc::new(RwLock::new(value))) }

    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = read(&self.0);
        f(&guard)
    }

    /// Replaces the value with whatever `decide` returns, if anything.
    ///
    /// `decide` sees the current value under the write lock. A panic inside it leaves the
    /// value untouched and is reported as no change.
    pub fn replace_with(&self, decide: impl FnOnce(&T) -> Option<T>) -> Option<T>
    where T: Clone {
        let mut guard = write(&self.0);
        match catch_unwind(AssertUnwindSafe(|| decide(&guard))) {
            Ok(Some(next)) => {
                *guard = next.clone();
                Some(next)
            }
            Ok(None) => None,
            Err(payload) => {
                tracing::warn!("update panicked, value left unchanged: {}", panic_message(&*payload));
                None
            }
        }
    }
}

impl<T: Clone> ValueCell<T> {
    pub fn value(&self) -> T { read(&self.0).clone() }
}
