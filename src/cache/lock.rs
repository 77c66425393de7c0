//! Lock helpers that survive poisoning.
//!
//! A panic while a partition or queue lock is held must not take the whole
//! interceptor down; the guard is recovered and the event logged.

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

fn recover<G>(poisoned: PoisonError<G>, site: &'static str, kind: &'static str) -> G {
    warn!(
        site,
        lock_kind = kind,
        result = "poisoned_recovered",
        "Recovered from poisoned lock; state may be stale"
    );
    poisoned.into_inner()
}

pub(crate) fn read_or_recover<'a, T>(
    lock: &'a RwLock<T>,
    site: &'static str,
) -> RwLockReadGuard<'a, T> {
    lock.read()
        .unwrap_or_else(|poisoned| recover(poisoned, site, "rwlock.read"))
}

pub(crate) fn write_or_recover<'a, T>(
    lock: &'a RwLock<T>,
    site: &'static str,
) -> RwLockWriteGuard<'a, T> {
    lock.write()
        .unwrap_or_else(|poisoned| recover(poisoned, site, "rwlock.write"))
}

pub(crate) fn lock_or_recover<'a, T>(lock: &'a Mutex<T>, site: &'static str) -> MutexGuard<'a, T> {
    lock.lock()
        .unwrap_or_else(|poisoned| recover(poisoned, site, "mutex.lock"))
}
