//! Primitive surface of the embedded foreign interpreter.
//!
//! The interpreter itself is not linked into this crate. Everything the core
//! needs from it is expressed as the [`InterpAbi`] trait and injected at
//! session construction: lock acquire/release, reference counting, slot
//! allocation, cooperative-GC hooks, buffer-protocol negotiation, baseline
//! snapshots, and the version query that gates the newer buffer primitives.
//!
//! The flat catalog of interpreter entry points (function bindings, numeric
//! and string conversion helpers) lives in whatever layer implements this
//! trait; the core only makes object-lifetime decisions and hands them back
//! through it.

use crate::error::{BridgeError, Result};
use std::fmt;
use std::sync::Arc;

/// Opaque, address-sized token identifying a foreign-side object slot.
///
/// Produced by [`InterpAbi::alloc_slot`] and never interpreted by the core.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub usize);

impl fmt::Debug for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeId({:#x})", self.0)
    }
}

/// Identity of the foreign type that produced a slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ForeignTypeId(pub usize);

/// Version of the embedded interpreter, used to gate newer buffer
/// primitives.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub struct InterpVersion {
    pub major: u16,
    pub minor: u16,
}

impl InterpVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Whether this interpreter carries the given primitive.
    #[inline]
    pub fn supports(self, feature: Feature) -> bool {
        self >= feature.required_version()
    }
}

impl fmt::Display for InterpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Buffer primitives that appeared over the interpreter's lifetime.
///
/// Calling one against an older interpreter fails with
/// [`BridgeError::UnsupportedByInterpreter`] naming the minimum version.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Feature {
    BufferPointer,
    CopyToContiguous,
    CopyFromContiguous,
    SizeFromFormat,
    FillContiguousStrides,
}

impl Feature {
    /// First interpreter version that ships the primitive.
    pub const fn required_version(self) -> InterpVersion {
        match self {
            Feature::BufferPointer => InterpVersion::new(3, 7),
            Feature::CopyToContiguous => InterpVersion::new(3, 8),
            Feature::CopyFromContiguous => InterpVersion::new(3, 8),
            Feature::FillContiguousStrides => InterpVersion::new(3, 8),
            Feature::SizeFromFormat => InterpVersion::new(3, 9),
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Feature::BufferPointer => "buffer_pointer",
            Feature::CopyToContiguous => "copy_to_contiguous",
            Feature::CopyFromContiguous => "copy_from_contiguous",
            Feature::FillContiguousStrides => "fill_contiguous_strides",
            Feature::SizeFromFormat => "size_from_format",
        }
    }
}

/// Memory layout order for contiguity tests and contiguous copies.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Contiguity {
    RowMajor,
    ColumnMajor,
    Either,
}

/// Negotiation flags for [`InterpAbi::get_buffer`].
///
/// Combined with `|`. `SIMPLE` requests a plain contiguous byte view.
pub mod view_flags {
    pub const SIMPLE: u32 = 0;
    pub const WRITABLE: u32 = 0x0001;
    pub const STRIDES: u32 = 0x0002;
    pub const C_CONTIGUOUS: u32 = 0x0004 | STRIDES;
    pub const F_CONTIGUOUS: u32 = 0x0008 | STRIDES;
    pub const ANY_CONTIGUOUS: u32 = 0x0010 | STRIDES;
    pub const FULL: u32 = WRITABLE | STRIDES;
}

/// Exporter-declared description of a raw memory region.
///
/// `shape`, `strides` and `suboffsets` are each either absent or carry
/// exactly `ndim` entries; [`crate::buffer::BufferView`] rejects anything
/// else at open time.
#[derive(Clone, Debug)]
pub struct RawBufferDesc {
    /// Base pointer into exporter-owned memory. Valid until the lease is
    /// released through [`InterpAbi::release_buffer`].
    pub base: *mut u8,
    /// Total length in bytes.
    pub len: usize,
    /// Size of one item in bytes.
    pub item_size: usize,
    pub read_only: bool,
    /// Number of dimensions. Zero denotes a scalar exporter.
    pub ndim: usize,
    pub shape: Option<Vec<isize>>,
    pub strides: Option<Vec<isize>>,
    pub suboffsets: Option<Vec<isize>>,
}

// SAFETY: the descriptor only carries the exporter's pointer, it never
// dereferences it. All dereferencing happens in BufferView under the foreign
// execution lock, and the exporter keeps the memory valid until the lease is
// released.
unsafe impl Send for RawBufferDesc {}

impl RawBufferDesc {
    /// Check the per-dimension arrays against `ndim`.
    pub(crate) fn layout_is_consistent(&self) -> bool {
        let dims_match = |v: &Option<Vec<isize>>| match v {
            Some(v) => v.len() == self.ndim,
            None => true,
        };
        dims_match(&self.shape) && dims_match(&self.strides) && dims_match(&self.suboffsets)
    }
}

/// Well-known foreign objects cached by the session at initialize time and
/// released at shutdown.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum WellKnown {
    BaseObjectType,
    NoneSingleton,
    BytesType,
}

impl WellKnown {
    pub const ALL: [WellKnown; 3] = [
        WellKnown::BaseObjectType,
        WellKnown::NoneSingleton,
        WellKnown::BytesType,
    ];
}

/// Opaque token for an interpreter baseline snapshot, produced by
/// [`InterpAbi::stash_baseline`] and consumed by
/// [`InterpAbi::restore_baseline`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct InterpBaseline(pub u64);

/// Callback invoked by the foreign dealloc path when a bridge-produced slot
/// is destroyed by the reference-count collector.
///
/// May fire on any thread, including while a host thread is mutating the
/// registry, which is why the registry carries its own short-lived lock.
pub type ReleaseHook = Arc<dyn Fn(NativeId) + Send + Sync>;

/// Low-level primitives consumed from the embedded interpreter.
///
/// Implementations wrap the real interpreter's C surface; tests inject an
/// in-memory stand-in. All methods that touch interpreter state expect the
/// caller to hold the foreign execution lock, mirroring the raw surface they
/// wrap. The exceptions are `acquire_lock`/`release_lock` themselves,
/// `incref`/`decref` (callable from the reclaim path under the lock), and
/// `version`, which is immutable after startup.
pub trait InterpAbi: Send + Sync {
    /// Interpreter version, fixed for the life of the process.
    fn version(&self) -> InterpVersion;

    /// Bring up the lock/threading subsystem. Called once per initialize.
    fn init_threading(&self);

    /// Finalize the interpreter. Irreversible for the current session;
    /// only the Normal shutdown mode calls this.
    fn finalize(&self);

    /// Acquire the global execution lock, blocking until available.
    fn acquire_lock(&self);

    /// Release the global execution lock.
    fn release_lock(&self);

    /// Increment the reference count of a foreign slot.
    fn incref(&self, id: NativeId);

    /// Decrement the reference count of a foreign slot. Dropping the last
    /// reference destroys the slot and fires the release hook if the slot
    /// was bridge-produced.
    fn decref(&self, id: NativeId);

    /// Allocate a fresh foreign slot of the given type with one reference,
    /// owned by the caller. Fails only on allocation failure.
    fn alloc_slot(&self, type_id: ForeignTypeId) -> Result<NativeId>;

    /// Hand a slot (back) to the foreign cycle collector.
    fn gc_track(&self, id: NativeId);

    /// Take a slot out of the foreign cycle collector's view; the caller
    /// becomes responsible for its lifetime bookkeeping.
    fn gc_untrack(&self, id: NativeId);

    /// Force a full collection pass.
    fn collect(&self);

    /// Raise the foreign-side error indicator.
    fn set_error(&self, message: &str);

    /// Clear the foreign-side error indicator.
    fn clear_error(&self);

    /// Register the callback fired when a bridge-produced slot is destroyed.
    fn set_release_hook(&self, hook: ReleaseHook);

    /// Install the host's import hook into the interpreter.
    fn install_import_hook(&self);

    /// Remove the host's import hook.
    fn remove_import_hook(&self);

    /// Look up a well-known object. Returns a borrowed identity; callers
    /// that cache it must `incref` it themselves.
    fn wellknown(&self, which: WellKnown) -> NativeId;

    /// Capture the interpreter's baseline state for a later restore.
    fn stash_baseline(&self) -> InterpBaseline;

    /// Restore a previously captured baseline.
    fn restore_baseline(&self, baseline: InterpBaseline);

    /// Negotiate a buffer view against an exporter. Fails with
    /// [`BridgeError::Protocol`] if the exporter lacks the protocol and
    /// [`BridgeError::Negotiation`] if the flags cannot be satisfied. On
    /// success the exporter holds a lease until `release_buffer`.
    fn get_buffer(&self, exporter: NativeId, flags: u32) -> Result<RawBufferDesc>;

    /// Release the lease obtained by `get_buffer`. Called exactly once per
    /// successful negotiation.
    fn release_buffer(&self, exporter: NativeId, desc: &RawBufferDesc);

    /// The foreign side's own contiguity test for a negotiated view.
    fn is_contiguous(&self, desc: &RawBufferDesc, order: Contiguity) -> bool;

    /// Pointer to the item at the given indices. Gated on
    /// [`Feature::BufferPointer`]; indices are validated by the caller.
    fn buffer_pointer(&self, desc: &RawBufferDesc, indices: &[isize]) -> *mut u8;

    /// Copy the (possibly strided) view into a contiguous destination.
    /// Gated on [`Feature::CopyToContiguous`].
    fn copy_to_contiguous(&self, dst: &mut [u8], desc: &RawBufferDesc, order: Contiguity);

    /// Fill the view from a contiguous source. Gated on
    /// [`Feature::CopyFromContiguous`].
    fn copy_from_contiguous(&self, desc: &RawBufferDesc, src: &[u8], order: Contiguity);

    /// Item size implied by a format string. Gated on
    /// [`Feature::SizeFromFormat`].
    fn size_from_format(&self, format: &str) -> Result<usize>;

    /// Strides describing a contiguous array of the given shape. Gated on
    /// [`Feature::FillContiguousStrides`].
    fn contiguous_strides(&self, shape: &[isize], item_size: isize, order: Contiguity)
        -> Vec<isize>;
}

/// Fail unless the interpreter carries `feature`.
pub(crate) fn require_feature(abi: &dyn InterpAbi, feature: Feature) -> Result<()> {
    let actual = abi.version();
    if actual.supports(feature) {
        Ok(())
    } else {
        Err(BridgeError::UnsupportedByInterpreter {
            feature: feature.name(),
            required: feature.required_version(),
            actual,
        })
    }
}
