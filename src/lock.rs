//! InterpLock - RAII guard over the foreign interpreter's execution lock.
//!
//! The interpreter enforces single-writer execution: only one thread may run
//! interpreter-visible logic at a time, though many host threads contend for
//! and hand off the lock. The core never acquires the lock implicitly;
//! callers scope it through [`crate::lifecycle::Session::lock`] and every
//! exit path, including panics, releases it via `Drop`.

use crate::abi::InterpAbi;
use crate::gc::ReclaimQueue;
use std::cell::Cell;
use std::sync::Arc;

thread_local! {
    /// Whether this thread currently holds the foreign execution lock.
    /// Queried by debug assertions in bridge and buffer operations.
    static LOCK_HELD: Cell<bool> = const { Cell::new(false) };
}

/// RAII guard for the foreign execution lock.
///
/// On construction:
/// - Acquires the lock through the ABI (blocking).
/// - Processes the deferred-reclaim queue, so releases that were dropped on
///   lock-less threads are applied before any new work.
///
/// On drop:
/// - Releases the lock, on every exit path.
///
/// # Example
///
/// ```ignore
/// let lock = session.lock();
/// let handle = bridge.attach(host, type_id, Tracking::Wrapper)?;
/// drop(lock);
/// ```
pub struct InterpLock {
    abi: Arc<dyn InterpAbi>,
}

impl InterpLock {
    /// Acquire the lock and drain pending reclaims.
    ///
    /// The foreign lock is not recursive; acquiring it again on a thread
    /// that already holds it would deadlock, so that is rejected up front.
    pub(crate) fn acquire(abi: Arc<dyn InterpAbi>, reclaim: &ReclaimQueue) -> Self {
        debug_assert!(
            !Self::is_held(),
            "foreign execution lock is not recursive; already held on this thread"
        );

        abi.acquire_lock();
        LOCK_HELD.with(|held| held.set(true));

        // Apply releases queued by lock-less drops before any new work.
        reclaim.process_all(abi.as_ref());

        Self { abi }
    }

    /// Whether the current thread holds the foreign execution lock.
    #[inline]
    pub fn is_held() -> bool {
        LOCK_HELD.with(|held| held.get())
    }
}

impl Drop for InterpLock {
    fn drop(&mut self) {
        LOCK_HELD.with(|held| held.set(false));
        self.abi.release_lock();
    }
}

impl std::fmt::Debug for InterpLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpLock").finish()
    }
}
