use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock `lock`, taking over the state if a previous holder panicked.
///
/// The guarded data is a queue of independent events, so a panic elsewhere
/// leaves nothing half-applied.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    source: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    lock.lock().unwrap_or_else(|poisoned| {
        warn!(
            op,
            source,
            result = "poisoned_recovered",
            "Recovered from poisoned lock"
        );
        poisoned.into_inner()
    })
}
