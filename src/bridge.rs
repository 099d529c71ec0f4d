//! ObjectBridge - per-object adapter between host objects and foreign slots.
//!
//! Gives any live foreign slot produced for a host object a cheap O(1) way
//! to recover that host object and vice versa, and participates in the
//! foreign collector's mark/clear protocol so that reference cycles spanning
//! both object models are collectible.
//!
//! Reference ownership: the slot's counted references all live on the
//! foreign side; `attach` hands its initial reference to the caller. The
//! bridge's grip is on the host object (the registry record), which it holds
//! until the foreign collector destroys the slot (release hook), an explicit
//! `detach`, or the shutdown drain.

use crate::abi::{ForeignTypeId, InterpAbi, NativeId};
use crate::error::{BridgeError, Result};
use crate::lock::InterpLock;
use crate::object::{BridgedObject, Visitor};
use crate::registry::{HandleRegistry, TrackedRecord, Tracking};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Caller-facing grip on a tracked object.
///
/// A lightweight token; dropping it releases nothing. Lifetime decisions
/// flow through the release hook, `detach`, or the shutdown drain.
#[derive(Clone, Debug)]
pub struct TrackedHandle {
    id: NativeId,
    tracking: Tracking,
}

impl TrackedHandle {
    #[inline]
    pub fn id(&self) -> NativeId {
        self.id
    }

    #[inline]
    pub fn tracking(&self) -> Tracking {
        self.tracking
    }
}

/// Adapter between the host object model and foreign slots.
///
/// Constructed by the session with an injected registry handle; revived
/// across soft-shutdown/reload cycles.
pub struct ObjectBridge {
    abi: Arc<dyn InterpAbi>,
    registry: Arc<HandleRegistry>,
    shut_down: AtomicBool,
}

impl ObjectBridge {
    pub(crate) fn new(abi: Arc<dyn InterpAbi>, registry: Arc<HandleRegistry>) -> Self {
        Self {
            abi,
            registry,
            shut_down: AtomicBool::new(true),
        }
    }

    /// Whether the bridge has been drained and not revived.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Re-arm the bridge at initialize time.
    pub(crate) fn revive(&self) {
        self.shut_down.store(false, Ordering::Release);
    }

    /// Surface a host object to the foreign side.
    ///
    /// Allocates a foreign slot of `type_id` and links it to `host`. The
    /// slot's initial reference is owned by the caller, to be handed to
    /// foreign code. Registered iff `tracking != Untracked`; `Extension`
    /// slots are taken out of the foreign collector's view, the bridge
    /// owning their lifetime bookkeeping until release or drain.
    ///
    /// Fails only on allocation failure, which is fatal by policy.
    /// Requires the foreign execution lock.
    pub fn attach(
        &self,
        host: Arc<dyn BridgedObject>,
        type_id: ForeignTypeId,
        tracking: Tracking,
    ) -> Result<TrackedHandle> {
        debug_assert!(InterpLock::is_held(), "attach requires the foreign lock");

        if self.is_shut_down() {
            return Err(BridgeError::UseAfterShutdown);
        }

        let id = self.abi.alloc_slot(type_id).inspect_err(|_| {
            log::error!("native identity allocation failed; bridge cannot continue");
        })?;

        match tracking {
            Tracking::Untracked => {}
            Tracking::Extension => {
                self.abi.gc_untrack(id);
                self.registry.insert(
                    id,
                    TrackedRecord {
                        host,
                        type_id,
                        tracking,
                    },
                );
            }
            Tracking::Wrapper => {
                self.registry.insert(
                    id,
                    TrackedRecord {
                        host,
                        type_id,
                        tracking,
                    },
                );
            }
        }

        tracing::trace!("attached {:?} as {:?}", id, tracking);
        Ok(TrackedHandle { id, tracking })
    }

    /// Recover the host object for a native identity.
    ///
    /// O(1); safe to call reentrantly from within a foreign call (the
    /// registry lock is held only for the lookup itself). Returns `None`
    /// for identities not produced by this bridge.
    pub fn resolve(&self, id: NativeId) -> Option<Arc<dyn BridgedObject>> {
        if self.is_shut_down() {
            return None;
        }
        self.registry.resolve(id)
    }

    /// Explicitly drop the bridge's grip on a tracked object.
    ///
    /// Safe to repeat: a second call on the same handle is a logged no-op.
    pub fn detach(&self, handle: &TrackedHandle) {
        self.release(handle.id());
    }

    /// Release path shared by `detach` and the foreign release hook.
    ///
    /// The hook fires when the foreign refcount collector destroys a
    /// bridge-produced slot, possibly on a thread other than the one doing
    /// host bookkeeping; the registry's own lock makes that safe.
    pub(crate) fn release(&self, id: NativeId) {
        match self.registry.remove(id) {
            Some(record) => {
                tracing::trace!("released {:?} ({:?})", id, record.tracking);
            }
            None => {
                log::debug!("release for untracked or already-released {id:?}");
            }
        }
    }

    /// Forward the foreign collector's cycle traversal to the counterpart.
    ///
    /// The counterpart's own traverse behavior does the walking; the bridge
    /// only remaps the native identity to the host reference. Nested
    /// lookups inside `visit` go through [`resolve`](Self::resolve).
    pub fn traverse(&self, handle: &TrackedHandle, visit: &mut Visitor<'_>) -> Result<()> {
        debug_assert!(InterpLock::is_held(), "traverse requires the foreign lock");

        match self.resolve(handle.id()) {
            Some(host) => {
                host.traverse(visit);
                Ok(())
            }
            None => {
                self.abi
                    .set_error("cycle traversal through a stale native identity");
                Err(BridgeError::UseAfterShutdown)
            }
        }
    }

    /// Forward the foreign collector's clear request to the counterpart.
    pub fn clear(&self, handle: &TrackedHandle) -> Result<()> {
        debug_assert!(InterpLock::is_held(), "clear requires the foreign lock");

        match self.resolve(handle.id()) {
            Some(host) => {
                host.clear();
                Ok(())
            }
            None => {
                self.abi
                    .set_error("cycle clear through a stale native identity");
                Err(BridgeError::UseAfterShutdown)
            }
        }
    }

    /// Number of live tracked objects.
    pub fn tracked_count(&self) -> usize {
        self.registry.len()
    }

    /// Shutdown drain: empty the registry and settle every record with the
    /// foreign collector.
    ///
    /// `Extension` records are processed first, handing their slots back to
    /// the collector so its normal finalization continues to operate; then
    /// every record's host grip is dropped, `Extension` and `Wrapper`
    /// alike. After the drain the bridge rejects mutation with
    /// [`BridgeError::UseAfterShutdown`] until revived.
    ///
    /// Requires the foreign execution lock.
    pub(crate) fn drain(&self) {
        debug_assert!(InterpLock::is_held(), "drain requires the foreign lock");

        self.shut_down.store(true, Ordering::Release);

        let records = self.registry.take_all();
        let total = records.len();

        let (extensions, wrappers): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|(_, record)| record.tracking == Tracking::Extension);

        for (id, record) in extensions {
            self.drain_extension(id, record);
        }
        for (id, record) in wrappers {
            self.drain_wrapper(id, record);
        }

        log::debug!("drained {total} tracked object(s)");
    }

    fn drain_extension(&self, id: NativeId, record: TrackedRecord) {
        // Hand lifetime bookkeeping back before the grip goes away.
        self.abi.gc_track(id);
        tracing::trace!("drained extension {:?}", id);
        drop(record);
    }

    fn drain_wrapper(&self, id: NativeId, record: TrackedRecord) {
        tracing::trace!("drained wrapper {:?}", id);
        drop(record);
    }
}

impl std::fmt::Debug for ObjectBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBridge")
            .field("tracked", &self.registry.len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
