//! Stash/restore of bridge-held state across a reload cycle.
//!
//! Under the Reload shutdown mode the whole bridge is torn down and later
//! reconstructed while the foreign interpreter's objects stay alive. The
//! stash is the in-process, version-matched artifact carrying everything
//! that must survive the teardown: the interpreter baseline, the module
//! bindings the session installed, and every tracked record together with
//! one extra foreign reference per identity so the slots outlive the drain.
//!
//! The stash is owned exclusively by the session between stash and restore.
//! It is not a durable file format.

use crate::abi::{ForeignTypeId, InterpBaseline, InterpVersion, NativeId};
use crate::gc::{Reclaim, ReclaimQueue};
use crate::lifecycle::ModuleBinding;
use crate::object::BridgedObject;
use crate::registry::Tracking;
use std::sync::Arc;

/// One tracked record preserved across the teardown.
pub(crate) struct StashedObject {
    pub id: NativeId,
    pub type_id: ForeignTypeId,
    pub tracking: Tracking,
    pub host: Arc<dyn BridgedObject>,
}

/// Bridge-held state serialized at Reload shutdown and popped by the next
/// initialize.
pub struct StashedState {
    pub(crate) version: InterpVersion,
    pub(crate) baseline: Option<InterpBaseline>,
    pub(crate) modules: Vec<ModuleBinding>,
    pub(crate) objects: Vec<StashedObject>,
    reclaim: Arc<ReclaimQueue>,
}

impl StashedState {
    pub(crate) fn new(
        version: InterpVersion,
        baseline: Option<InterpBaseline>,
        modules: Vec<ModuleBinding>,
        objects: Vec<StashedObject>,
        reclaim: Arc<ReclaimQueue>,
    ) -> Self {
        Self {
            version,
            baseline,
            modules,
            objects,
            reclaim,
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }
}

impl Drop for StashedState {
    fn drop(&mut self) {
        // A restored stash is emptied first, so this only fires for a stash
        // discarded without restore. The foreign references it owns are
        // released through the reclaim queue, since the dropping thread may
        // not hold the foreign lock.
        let leaked = self.objects.len() + self.modules.len();
        if leaked == 0 {
            return;
        }

        log::warn!("discarding unrestored reload stash ({leaked} foreign reference(s))");
        for object in self.objects.drain(..) {
            self.reclaim.defer(Reclaim::IdentityRef(object.id));
        }
        for binding in self.modules.drain(..) {
            self.reclaim.defer(Reclaim::IdentityRef(binding.handle));
        }
    }
}

impl std::fmt::Debug for StashedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StashedState")
            .field("version", &self.version)
            .field("modules", &self.modules.len())
            .field("objects", &self.objects.len())
            .finish()
    }
}
