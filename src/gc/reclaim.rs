//! Thread-safe queue of deferred foreign-resource releases.

use crate::abi::{InterpAbi, NativeId, RawBufferDesc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// One deferred release action.
///
/// A tagged variant per resource kind, so the processing loop dispatches
/// explicitly instead of carrying type-erased closures.
pub enum Reclaim {
    /// Drop one foreign reference held by the host side.
    IdentityRef(NativeId),
    /// Release a buffer lease (and the strong reference on its exporter)
    /// that was dropped without an explicit close.
    BufferLease {
        exporter: NativeId,
        desc: RawBufferDesc,
    },
}

impl std::fmt::Debug for Reclaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reclaim::IdentityRef(id) => f.debug_tuple("IdentityRef").field(id).finish(),
            Reclaim::BufferLease { exporter, .. } => {
                f.debug_struct("BufferLease").field("exporter", exporter).finish()
            }
        }
    }
}

/// Queue of releases pending the next lock acquisition.
///
/// Receives entries from any thread; [`process_all`](ReclaimQueue::process_all)
/// runs under the foreign execution lock.
pub struct ReclaimQueue {
    /// Pending release actions.
    queue: Mutex<VecDeque<Reclaim>>,

    /// Fast check for pending items (avoids lock acquisition on hot path).
    pending_count: AtomicU64,
}

impl Default for ReclaimQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReclaimQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(8)),
            pending_count: AtomicU64::new(0),
        }
    }

    /// Queue a release. Thread-safe; does not require the foreign lock.
    pub fn defer(&self, action: Reclaim) {
        self.queue
            .lock()
            .expect("reclaim queue poisoned")
            .push_back(action);
        self.pending_count.fetch_add(1, Ordering::Release);

        tracing::trace!("deferred foreign release (pending: {})", self.len());
    }

    /// Check for pending releases without taking the queue lock.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending_count.load(Ordering::Acquire) > 0
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.pending_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        !self.has_pending()
    }

    /// Apply all pending releases.
    ///
    /// Must run while the foreign execution lock is held; called from
    /// `InterpLock` construction so the queue drains before any new work.
    pub fn process_all(&self, abi: &dyn InterpAbi) {
        // Fast path: nothing pending.
        if !self.has_pending() {
            return;
        }

        let actions: VecDeque<Reclaim> = {
            let mut queue = self.queue.lock().expect("reclaim queue poisoned");
            std::mem::take(&mut *queue)
        };

        let count = actions.len();
        if count == 0 {
            return;
        }

        for action in actions {
            match action {
                Reclaim::IdentityRef(id) => abi.decref(id),
                Reclaim::BufferLease { exporter, desc } => {
                    abi.release_buffer(exporter, &desc);
                    abi.decref(exporter);
                }
            }
        }

        self.pending_count.fetch_sub(count as u64, Ordering::Release);

        tracing::trace!("processed {} deferred foreign releases", count);
    }
}

impl std::fmt::Debug for ReclaimQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimQueue")
            .field("pending_count", &self.len())
            .finish()
    }
}
