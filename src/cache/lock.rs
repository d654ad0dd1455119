use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a store mutex, recovering the guard if a previous holder panicked.
///
/// A poisoned store only ever holds whole entries, so the recovered state
/// is still usable; the worst case is an entry that should have been
/// evicted.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    store: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(
            op,
            store,
            lock_kind = "mutex.lock",
            result = "poisoned_recovered",
            "Recovered from poisoned cache store lock"
        );
        poisoned.into_inner()
    })
}
