use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::RwLock;
use std::sync::RwLockReadGuard;
use std::sync::RwLockWriteGuard;

use tracing::error;

/// Acquires a read lock, recovering from poison if a thread panicked while
/// holding it. Recovery keeps the daemon serving; the panic itself is the
/// bug to investigate.
pub fn rwlock_read_or_recover<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| {
        error!("rwlock poisoned (read), recovering");
        poisoned.into_inner()
    })
}

/// Acquires a write lock, recovering from poison if a thread panicked while
/// holding it.
pub fn rwlock_write_or_recover<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| {
        error!("rwlock poisoned (write), recovering");
        poisoned.into_inner()
    })
}

/// Acquires a mutex, recovering from poison if a thread panicked while
/// holding it.
pub fn mutex_lock_or_recover<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        error!("mutex poisoned, recovering");
        poisoned.into_inner()
    })
}
