//! Lock helpers for consistent poison handling
//!
//! Instead of panicking on `PoisonError`, these recover by unwrapping the
//! inner value so a panicking user callback cannot wedge an instance.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};


/// Acquires a mutex lock, recovering from poison if necessary.
#[inline]
pub(crate) fn lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        log_warn!("mutex was poisoned, recovering");
        poisoned.into_inner()
    })
}

/// Acquires a read lock on an RwLock, recovering from poison if necessary.
#[inline]
pub(crate) fn read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        log_warn!("rwlock was poisoned (read), recovering");
        poisoned.into_inner()
    })
}

/// Acquires a write lock on an RwLock, recovering from poison if necessary.
#[inline]
pub(crate) fn write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        log_warn!("rwlock was poisoned (write), recovering");
        poisoned.into_inner()
    })
}
