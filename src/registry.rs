//! Process-wide table of tracked objects, keyed by native identity.
//!
//! The registry has its own short-lived mutex, independent of the foreign
//! execution lock: release callbacks fire asynchronously relative to
//! host-thread bookkeeping (e.g. during a host-triggered collection pass on
//! a different thread), so the table cannot rely on the single-writer
//! discipline that covers interpreter-visible logic.
//!
//! The registry is an injectable service with a lifecycle tied to the
//! session: the session constructs it, the bridge receives a handle to it,
//! and shutdown clears it.

use crate::abi::{ForeignTypeId, NativeId};
use crate::object::BridgedObject;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// How a tracked slot's storage relates to the bridge.
///
/// `Extension` slots were carved out of the foreign side by the bridge
/// itself and must be handed back to the foreign collector at shutdown so
/// its normal finalization continues to operate. `Wrapper` slots are
/// standalone foreign objects merely annotated with a back-reference and are
/// simply unregistered. `Untracked` objects never enter the table at all.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Tracking {
    Untracked,
    Extension,
    Wrapper,
}

/// One live tracked object: the host reference owned while tracked, plus
/// the immutable classification assigned at attach time.
#[derive(Clone)]
pub struct TrackedRecord {
    pub host: Arc<dyn BridgedObject>,
    pub type_id: ForeignTypeId,
    pub tracking: Tracking,
}

impl std::fmt::Debug for TrackedRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedRecord")
            .field("type_id", &self.type_id)
            .field("tracking", &self.tracking)
            .finish()
    }
}

/// Table mapping live native identities to their tracked records.
///
/// At most one record exists per live identity; a record exists iff the
/// identity still refers to a live foreign slot produced by this bridge.
pub struct HandleRegistry {
    entries: Mutex<HashMap<NativeId, TrackedRecord>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Insert a record for a freshly allocated identity.
    pub fn insert(&self, id: NativeId, record: TrackedRecord) {
        let prev = self
            .entries
            .lock()
            .expect("handle registry poisoned")
            .insert(id, record);
        debug_assert!(prev.is_none(), "duplicate record for {id:?}");
        tracing::trace!("registered {:?}", id);
    }

    /// O(1) lookup of the host counterpart. `None` for identities this
    /// bridge did not produce; arbitrary unrelated foreign objects are
    /// routinely passed in, so absence is not an error.
    pub fn resolve(&self, id: NativeId) -> Option<Arc<dyn BridgedObject>> {
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .get(&id)
            .map(|record| Arc::clone(&record.host))
    }

    /// Remove and return the record for `id`, if present.
    pub fn remove(&self, id: NativeId) -> Option<TrackedRecord> {
        let record = self
            .entries
            .lock()
            .expect("handle registry poisoned")
            .remove(&id);
        if record.is_some() {
            tracing::trace!("unregistered {:?}", id);
        }
        record
    }

    pub fn contains(&self, id: NativeId) -> bool {
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .contains_key(&id)
    }

    /// Snapshot of every live record. Used to build the reload stash before
    /// the drain empties the table.
    pub fn snapshot(&self) -> Vec<(NativeId, TrackedRecord)> {
        self.entries
            .lock()
            .expect("handle registry poisoned")
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect()
    }

    /// Empty the table, returning every record for the drain loop.
    pub fn take_all(&self) -> Vec<(NativeId, TrackedRecord)> {
        let mut entries = self.entries.lock().expect("handle registry poisoned");
        entries.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("handle registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for HandleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleRegistry")
            .field("len", &self.len())
            .finish()
    }
}
