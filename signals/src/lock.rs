//! Lock accessors that ignore poisoning.
//!
//! User code that runs under one of these locks is wrapped in `catch_unwind`, so a poisoned
//! lock still guards consistent data.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> { lock.read().unwrap_or_else(PoisonError::into_inner) }

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> { lock.write().unwrap_or_else(PoisonError::into_inner) }

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> { mutex.lock().unwrap_or_else(PoisonError::into_inner) }
