//! In-memory stand-in for the embedded interpreter, plus shared fixtures.
//!
//! Implements the full primitive surface over an owned slot table: counted
//! references, release-hook firing at refcount zero, buffer exporters backed
//! by owned byte storage with lease counting, and a settable version for
//! exercising the gated primitives.

#![allow(dead_code)]

use hostlink::{
    BridgeError, BridgedObject, Contiguity, ForeignTypeId, InterpAbi, InterpBaseline,
    InterpVersion, NativeId, RawBufferDesc, ReleaseHook, Result, Visitor, WellKnown,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Serializes tests that claim the process-wide running-session slot.
static SESSION_GUARD: Mutex<()> = Mutex::new(());

pub fn session_guard() -> MutexGuard<'static, ()> {
    SESSION_GUARD.lock().unwrap_or_else(|e| e.into_inner())
}

pub const PLAIN_TYPE: ForeignTypeId = ForeignTypeId(0x10);
pub const MODULE_TYPE: ForeignTypeId = ForeignTypeId(0x11);

struct Slot {
    refcount: usize,
    type_id: ForeignTypeId,
    gc_tracked: bool,
    bridge_produced: bool,
}

struct Exporter {
    data: Box<[u8]>,
    read_only: bool,
    item_size: usize,
    ndim: usize,
    shape: Option<Vec<isize>>,
    strides: Option<Vec<isize>>,
    leases: usize,
}

struct FakeState {
    next_id: usize,
    slots: HashMap<NativeId, Slot>,
    exporters: HashMap<NativeId, Exporter>,
}

/// Condvar-backed stand-in for the interpreter's global execution lock.
struct ExecLock {
    locked: Mutex<bool>,
    cv: Condvar,
}

impl ExecLock {
    fn new() -> Self {
        Self {
            locked: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut locked = self.locked.lock().unwrap();
        while *locked {
            locked = self.cv.wait(locked).unwrap();
        }
        *locked = true;
    }

    fn release(&self) {
        let mut locked = self.locked.lock().unwrap();
        assert!(*locked, "execution lock released while free");
        *locked = false;
        drop(locked);
        self.cv.notify_one();
    }
}

pub struct FakeInterp {
    state: Mutex<FakeState>,
    exec_lock: ExecLock,
    version: Mutex<InterpVersion>,
    hook: Mutex<Option<ReleaseHook>>,
    wellknown: HashMap<WellKnown, NativeId>,
    fail_alloc: AtomicBool,
    finalized: AtomicBool,
    import_hook: AtomicBool,
    threading_inits: AtomicUsize,
    collects: AtomicUsize,
    baseline_counter: AtomicUsize,
    restored_baseline: Mutex<Option<InterpBaseline>>,
    error: Mutex<Option<String>>,
}

impl FakeInterp {
    pub fn new() -> Self {
        let mut state = FakeState {
            next_id: 0x1000,
            slots: HashMap::new(),
            exporters: HashMap::new(),
        };
        let mut wellknown = HashMap::new();
        for which in WellKnown::ALL {
            let id = NativeId(state.next_id);
            state.next_id += 0x10;
            state.slots.insert(
                id,
                Slot {
                    refcount: 1,
                    type_id: ForeignTypeId(0x1),
                    gc_tracked: false,
                    bridge_produced: false,
                },
            );
            wellknown.insert(which, id);
        }

        Self {
            state: Mutex::new(state),
            exec_lock: ExecLock::new(),
            version: Mutex::new(InterpVersion::new(3, 11)),
            hook: Mutex::new(None),
            wellknown,
            fail_alloc: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            import_hook: AtomicBool::new(false),
            threading_inits: AtomicUsize::new(0),
            collects: AtomicUsize::new(0),
            baseline_counter: AtomicUsize::new(0),
            restored_baseline: Mutex::new(None),
            error: Mutex::new(None),
        }
    }

    pub fn with_version(major: u16, minor: u16) -> Self {
        let interp = Self::new();
        interp.set_version(InterpVersion::new(major, minor));
        interp
    }

    pub fn set_version(&self, version: InterpVersion) {
        *self.version.lock().unwrap() = version;
    }

    pub fn set_alloc_failure(&self, fail: bool) {
        self.fail_alloc.store(fail, Ordering::SeqCst);
    }

    fn fresh_slot(&self, state: &mut FakeState, type_id: ForeignTypeId, produced: bool) -> NativeId {
        let id = NativeId(state.next_id);
        state.next_id += 0x10;
        state.slots.insert(
            id,
            Slot {
                refcount: 1,
                type_id,
                gc_tracked: true,
                bridge_produced: produced,
            },
        );
        id
    }

    /// Allocate a plain foreign object (not bridge-produced), as foreign
    /// code would.
    pub fn new_foreign_object(&self, type_id: ForeignTypeId) -> NativeId {
        let mut state = self.state.lock().unwrap();
        self.fresh_slot(&mut state, type_id, false)
    }

    /// One-dimensional byte exporter over owned storage.
    pub fn add_bytes_exporter(&self, data: Vec<u8>, read_only: bool) -> NativeId {
        let len = data.len() as isize;
        self.add_exporter(data, read_only, 1, 1, Some(vec![len]), Some(vec![1]))
    }

    /// C-order matrix exporter (two dimensions, one-byte items).
    pub fn add_matrix_exporter(&self, rows: usize, cols: usize) -> NativeId {
        let data = vec![0u8; rows * cols];
        self.add_exporter(
            data,
            false,
            1,
            2,
            Some(vec![rows as isize, cols as isize]),
            Some(vec![cols as isize, 1]),
        )
    }

    /// Scalar exporter: zero dimensions, one item.
    pub fn add_scalar_exporter(&self, data: Vec<u8>) -> NativeId {
        let item = data.len();
        self.add_exporter(data, true, item, 0, None, None)
    }

    /// Exporter whose declared shape disagrees with its dimensionality.
    pub fn add_malformed_exporter(&self) -> NativeId {
        self.add_exporter(vec![0u8; 8], false, 1, 1, Some(vec![4, 2]), None)
    }

    fn add_exporter(
        &self,
        data: Vec<u8>,
        read_only: bool,
        item_size: usize,
        ndim: usize,
        shape: Option<Vec<isize>>,
        strides: Option<Vec<isize>>,
    ) -> NativeId {
        let mut state = self.state.lock().unwrap();
        let id = self.fresh_slot(&mut state, ForeignTypeId(0x2), false);
        state.exporters.insert(
            id,
            Exporter {
                data: data.into_boxed_slice(),
                read_only,
                item_size,
                ndim,
                shape,
                strides,
                leases: 0,
            },
        );
        id
    }

    // Assertion helpers

    pub fn refcount(&self, id: NativeId) -> Option<usize> {
        self.state.lock().unwrap().slots.get(&id).map(|s| s.refcount)
    }

    pub fn slot_exists(&self, id: NativeId) -> bool {
        self.state.lock().unwrap().slots.contains_key(&id)
    }

    pub fn is_gc_tracked(&self, id: NativeId) -> bool {
        self.state
            .lock()
            .unwrap()
            .slots
            .get(&id)
            .map(|s| s.gc_tracked)
            .unwrap_or(false)
    }

    pub fn lease_count(&self, id: NativeId) -> usize {
        self.state
            .lock()
            .unwrap()
            .exporters
            .get(&id)
            .map(|e| e.leases)
            .unwrap_or(0)
    }

    pub fn exporter_bytes(&self, id: NativeId) -> Vec<u8> {
        self.state.lock().unwrap().exporters[&id].data.to_vec()
    }

    pub fn collect_count(&self) -> usize {
        self.collects.load(Ordering::SeqCst)
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    pub fn import_hook_installed(&self) -> bool {
        self.import_hook.load(Ordering::SeqCst)
    }

    pub fn threading_inits(&self) -> usize {
        self.threading_inits.load(Ordering::SeqCst)
    }

    pub fn restored_baseline(&self) -> Option<InterpBaseline> {
        *self.restored_baseline.lock().unwrap()
    }

    pub fn last_error(&self) -> Option<String> {
        self.error.lock().unwrap().clone()
    }

    fn desc_strides(desc: &RawBufferDesc) -> Vec<isize> {
        match &desc.strides {
            Some(strides) => strides.clone(),
            None => match &desc.shape {
                Some(shape) => c_order_strides(shape, desc.item_size as isize),
                None => Vec::new(),
            },
        }
    }
}

fn c_order_strides(shape: &[isize], item_size: isize) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = item_size;
    for dim in (0..shape.len()).rev() {
        strides[dim] = acc;
        acc *= shape[dim].max(1);
    }
    strides
}

fn f_order_strides(shape: &[isize], item_size: isize) -> Vec<isize> {
    let mut strides = vec![0isize; shape.len()];
    let mut acc = item_size;
    for dim in 0..shape.len() {
        strides[dim] = acc;
        acc *= shape[dim].max(1);
    }
    strides
}

/// Walk a multi-index odometer over `shape`, yielding flat strided offsets.
fn strided_offsets(shape: &[isize], strides: &[isize]) -> Vec<isize> {
    let mut offsets = Vec::new();
    let mut index = vec![0isize; shape.len()];
    if shape.iter().any(|&extent| extent == 0) {
        return offsets;
    }
    loop {
        let offset = index
            .iter()
            .zip(strides.iter())
            .map(|(&i, &s)| i * s)
            .sum();
        offsets.push(offset);

        let mut dim = shape.len();
        loop {
            if dim == 0 {
                return offsets;
            }
            dim -= 1;
            index[dim] += 1;
            if index[dim] < shape[dim] {
                break;
            }
            index[dim] = 0;
        }
    }
}

impl InterpAbi for FakeInterp {
    fn version(&self) -> InterpVersion {
        *self.version.lock().unwrap()
    }

    fn init_threading(&self) {
        self.finalized.store(false, Ordering::SeqCst);
        self.threading_inits.fetch_add(1, Ordering::SeqCst);
    }

    fn finalize(&self) {
        self.finalized.store(true, Ordering::SeqCst);
    }

    fn acquire_lock(&self) {
        self.exec_lock.acquire();
    }

    fn release_lock(&self) {
        self.exec_lock.release();
    }

    fn incref(&self, id: NativeId) {
        let mut state = self.state.lock().unwrap();
        let slot = state.slots.get_mut(&id).expect("incref on dead slot");
        slot.refcount += 1;
    }

    fn decref(&self, id: NativeId) {
        let fire = {
            let mut state = self.state.lock().unwrap();
            let slot = state.slots.get_mut(&id).expect("decref on dead slot");
            assert!(slot.refcount > 0, "refcount underflow on {id:?}");
            slot.refcount -= 1;
            if slot.refcount == 0 {
                let produced = slot.bridge_produced;
                state.slots.remove(&id);
                state.exporters.remove(&id);
                produced
            } else {
                false
            }
        };

        // The dealloc path runs outside the slot table lock, like a real
        // interpreter calling back into the embedder.
        if fire {
            let hook = self.hook.lock().unwrap().clone();
            if let Some(hook) = hook {
                hook(id);
            }
        }
    }

    fn alloc_slot(&self, type_id: ForeignTypeId) -> Result<NativeId> {
        if self.fail_alloc.load(Ordering::SeqCst) {
            return Err(BridgeError::Allocation);
        }
        let mut state = self.state.lock().unwrap();
        Ok(self.fresh_slot(&mut state, type_id, true))
    }

    fn gc_track(&self, id: NativeId) {
        if let Some(slot) = self.state.lock().unwrap().slots.get_mut(&id) {
            slot.gc_tracked = true;
        }
    }

    fn gc_untrack(&self, id: NativeId) {
        if let Some(slot) = self.state.lock().unwrap().slots.get_mut(&id) {
            slot.gc_tracked = false;
        }
    }

    fn collect(&self) {
        self.collects.fetch_add(1, Ordering::SeqCst);
    }

    fn set_error(&self, message: &str) {
        *self.error.lock().unwrap() = Some(message.to_owned());
    }

    fn clear_error(&self) {
        *self.error.lock().unwrap() = None;
    }

    fn set_release_hook(&self, hook: ReleaseHook) {
        *self.hook.lock().unwrap() = Some(hook);
    }

    fn install_import_hook(&self) {
        self.import_hook.store(true, Ordering::SeqCst);
    }

    fn remove_import_hook(&self) {
        self.import_hook.store(false, Ordering::SeqCst);
    }

    fn wellknown(&self, which: WellKnown) -> NativeId {
        self.wellknown[&which]
    }

    fn stash_baseline(&self) -> InterpBaseline {
        let token = self.baseline_counter.fetch_add(1, Ordering::SeqCst);
        InterpBaseline(token as u64 + 1)
    }

    fn restore_baseline(&self, baseline: InterpBaseline) {
        *self.restored_baseline.lock().unwrap() = Some(baseline);
    }

    fn get_buffer(&self, exporter: NativeId, flags: u32) -> Result<RawBufferDesc> {
        let mut state = self.state.lock().unwrap();
        let entry = match state.exporters.get_mut(&exporter) {
            Some(entry) => entry,
            None => return Err(BridgeError::Protocol),
        };

        if flags & hostlink::view_flags::WRITABLE != 0 && entry.read_only {
            return Err(BridgeError::Negotiation(
                "write requested on a read-only exporter".into(),
            ));
        }

        entry.leases += 1;
        Ok(RawBufferDesc {
            base: entry.data.as_mut_ptr(),
            len: entry.data.len(),
            item_size: entry.item_size,
            read_only: entry.read_only,
            ndim: entry.ndim,
            shape: entry.shape.clone(),
            strides: entry.strides.clone(),
            suboffsets: None,
        })
    }

    fn release_buffer(&self, exporter: NativeId, _desc: &RawBufferDesc) {
        let mut state = self.state.lock().unwrap();
        let entry = state
            .exporters
            .get_mut(&exporter)
            .expect("lease release on dead exporter");
        assert!(entry.leases > 0, "lease underflow on {exporter:?}");
        entry.leases -= 1;
    }

    fn is_contiguous(&self, desc: &RawBufferDesc, order: Contiguity) -> bool {
        if desc.ndim == 0 {
            return true;
        }
        let shape = match &desc.shape {
            Some(shape) => shape,
            None => return true,
        };
        let strides = Self::desc_strides(desc);
        let item = desc.item_size as isize;
        let c = strides == c_order_strides(shape, item);
        let f = strides == f_order_strides(shape, item);
        match order {
            Contiguity::RowMajor => c,
            Contiguity::ColumnMajor => f,
            Contiguity::Either => c || f,
        }
    }

    fn buffer_pointer(&self, desc: &RawBufferDesc, indices: &[isize]) -> *mut u8 {
        let strides = Self::desc_strides(desc);
        let offset: isize = indices
            .iter()
            .zip(strides.iter())
            .map(|(&i, &s)| i * s)
            .sum();
        // SAFETY: indices were bounds-checked by the caller against the
        // declared shape; the offset stays inside the exporter's storage.
        unsafe { desc.base.offset(offset) }
    }

    fn copy_to_contiguous(&self, dst: &mut [u8], desc: &RawBufferDesc, order: Contiguity) {
        let item = desc.item_size;
        let shape = desc
            .shape
            .clone()
            .unwrap_or_else(|| vec![(desc.len / item.max(1)) as isize]);
        let strides = desc
            .strides
            .clone()
            .unwrap_or_else(|| c_order_strides(&shape, item as isize));
        let dst_strides = match order {
            Contiguity::ColumnMajor => f_order_strides(&shape, item as isize),
            _ => c_order_strides(&shape, item as isize),
        };
        let src_offsets = strided_offsets(&shape, &strides);
        let dst_offsets = strided_offsets(&shape, &dst_strides);
        for (src, out) in src_offsets.into_iter().zip(dst_offsets) {
            // SAFETY: both offsets walk the declared shape, which the
            // exporter guarantees stays inside its storage.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    desc.base.offset(src),
                    dst.as_mut_ptr().offset(out),
                    item,
                );
            }
        }
    }

    fn copy_from_contiguous(&self, desc: &RawBufferDesc, src: &[u8], order: Contiguity) {
        let item = desc.item_size;
        let shape = desc
            .shape
            .clone()
            .unwrap_or_else(|| vec![(desc.len / item.max(1)) as isize]);
        let strides = desc
            .strides
            .clone()
            .unwrap_or_else(|| c_order_strides(&shape, item as isize));
        let src_strides = match order {
            Contiguity::ColumnMajor => f_order_strides(&shape, item as isize),
            _ => c_order_strides(&shape, item as isize),
        };
        let dst_offsets = strided_offsets(&shape, &strides);
        let src_offsets = strided_offsets(&shape, &src_strides);
        for (out, from) in dst_offsets.into_iter().zip(src_offsets) {
            // SAFETY: as in copy_to_contiguous, both walks stay inside the
            // declared extents.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr().offset(from),
                    desc.base.offset(out),
                    item,
                );
            }
        }
    }

    fn size_from_format(&self, format: &str) -> Result<usize> {
        match format {
            "b" | "B" | "c" => Ok(1),
            "h" | "H" => Ok(2),
            "i" | "I" | "f" => Ok(4),
            "q" | "Q" | "d" => Ok(8),
            other => Err(BridgeError::Negotiation(format!(
                "unknown format string {other:?}"
            ))),
        }
    }

    fn contiguous_strides(
        &self,
        shape: &[isize],
        item_size: isize,
        order: Contiguity,
    ) -> Vec<isize> {
        match order {
            Contiguity::ColumnMajor => f_order_strides(shape, item_size),
            _ => c_order_strides(shape, item_size),
        }
    }
}

/// Host-side fixture: carries a label and a set of foreign references so
/// traverse/clear forwarding is observable.
pub struct HostProbe {
    pub label: String,
    refs: Mutex<Vec<NativeId>>,
    cleared: AtomicBool,
}

impl HostProbe {
    pub fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_owned(),
            refs: Mutex::new(Vec::new()),
            cleared: AtomicBool::new(false),
        })
    }

    pub fn with_refs(label: &str, refs: Vec<NativeId>) -> Arc<Self> {
        let probe = Self::new(label);
        *probe.refs.lock().unwrap() = refs;
        probe
    }

    pub fn was_cleared(&self) -> bool {
        self.cleared.load(Ordering::SeqCst)
    }
}

impl BridgedObject for HostProbe {
    fn traverse(&self, visit: &mut Visitor<'_>) {
        for &id in self.refs.lock().unwrap().iter() {
            visit(id);
        }
    }

    fn clear(&self) {
        self.refs.lock().unwrap().clear();
        self.cleared.store(true, Ordering::SeqCst);
    }
}
