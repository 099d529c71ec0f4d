//! BufferView - RAII window onto memory owned by a foreign exporter.
//!
//! Negotiates, describes, and transfers bytes through a buffer-protocol
//! exporter without ever reading past the exporter-declared bounds. Every
//! bounds and state check happens before any native memory is touched.
//!
//! The explicit [`close`](BufferView::close) is the performance- and
//! correctness-critical path: it releases the exporter's lease exactly once,
//! on every exit path, when called inside a scope that holds the foreign
//! lock. Dropping an un-closed view only queues the release for the next
//! lock acquisition, as a leak backstop; never rely on it.

use crate::abi::{
    require_feature, Contiguity, Feature, InterpAbi, NativeId, RawBufferDesc,
};
use crate::error::{BridgeError, Result};
use crate::gc::{Reclaim, ReclaimQueue};
use crate::lock::InterpLock;
use bytes::Bytes;
use std::sync::Arc;

/// A temporary read/write window onto a foreign exporter's memory.
///
/// Created through [`crate::lifecycle::Session::open_view`]. Holds a strong
/// reference on the exporter and a buffer lease for its whole lifetime.
pub struct BufferView {
    abi: Arc<dyn InterpAbi>,
    reclaim: Arc<ReclaimQueue>,
    exporter: NativeId,
    /// `None` once closed; every accessor checks this first.
    desc: Option<RawBufferDesc>,
}

impl BufferView {
    /// Negotiate a view against `exporter` with the given
    /// [`crate::abi::view_flags`]. Requires the foreign execution lock.
    ///
    /// On failure the foreign error indicator is cleared; the error is
    /// reported to the host caller instead.
    pub(crate) fn open(
        abi: Arc<dyn InterpAbi>,
        reclaim: Arc<ReclaimQueue>,
        exporter: NativeId,
        flags: u32,
    ) -> Result<Self> {
        debug_assert!(InterpLock::is_held(), "open requires the foreign lock");

        let desc = match abi.get_buffer(exporter, flags) {
            Ok(desc) => desc,
            Err(err) => {
                abi.clear_error();
                return Err(err);
            }
        };

        if !desc.layout_is_consistent() {
            abi.release_buffer(exporter, &desc);
            return Err(BridgeError::Negotiation(format!(
                "exporter declared {} dimension(s) but mismatched layout arrays",
                desc.ndim
            )));
        }

        // The view keeps its exporter alive for as long as the lease lasts.
        abi.incref(exporter);

        tracing::trace!(
            "opened view on {:?}: {} bytes, ndim {}",
            exporter,
            desc.len,
            desc.ndim
        );

        Ok(Self {
            abi,
            reclaim,
            exporter,
            desc: Some(desc),
        })
    }

    fn desc(&self) -> Result<&RawBufferDesc> {
        self.desc.as_ref().ok_or(BridgeError::UseAfterClose)
    }

    /// The exporter this view leases from.
    pub fn exporter(&self) -> NativeId {
        self.exporter
    }

    /// Total length in bytes.
    pub fn len(&self) -> Result<usize> {
        Ok(self.desc()?.len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.desc()?.len == 0)
    }

    pub fn item_size(&self) -> Result<usize> {
        Ok(self.desc()?.item_size)
    }

    pub fn dimensions(&self) -> Result<usize> {
        Ok(self.desc()?.ndim)
    }

    pub fn is_read_only(&self) -> Result<bool> {
        Ok(self.desc()?.read_only)
    }

    pub fn shape(&self) -> Result<Option<&[isize]>> {
        Ok(self.desc()?.shape.as_deref())
    }

    pub fn strides(&self) -> Result<Option<&[isize]>> {
        Ok(self.desc()?.strides.as_deref())
    }

    pub fn suboffsets(&self) -> Result<Option<&[isize]>> {
        Ok(self.desc()?.suboffsets.as_deref())
    }

    /// Whether the view is still open.
    pub fn is_open(&self) -> bool {
        self.desc.is_some()
    }

    /// Flat byte copies are only defined for one-dimensional views laid out
    /// contiguously; richer N-dimensional transfer goes through
    /// [`copy_to_contiguous`](Self::copy_to_contiguous) and
    /// [`copy_from_contiguous`](Self::copy_from_contiguous).
    fn require_flat(&self, desc: &RawBufferDesc) -> Result<()> {
        if desc.ndim != 1 || !self.abi.is_contiguous(desc, Contiguity::Either) {
            return Err(BridgeError::UnsupportedShape { ndim: desc.ndim });
        }
        Ok(())
    }

    /// Copy bytes out of the view starting at `offset`.
    ///
    /// Copies `min(dst.len(), remaining past offset)` bytes and returns the
    /// count; an offset at or past the end copies nothing. Requires the
    /// foreign execution lock.
    pub fn read(&self, dst: &mut [u8], offset: usize) -> Result<usize> {
        debug_assert!(InterpLock::is_held(), "read requires the foreign lock");

        let desc = self.desc()?;
        self.require_flat(desc)?;

        let remaining = desc.len.saturating_sub(offset);
        let count = dst.len().min(remaining);
        if count > 0 {
            // SAFETY: offset + count <= desc.len, the exporter keeps
            // [base, base + len) valid while the lease is held, and the
            // foreign lock serializes access to it.
            unsafe {
                std::ptr::copy_nonoverlapping(desc.base.add(offset), dst.as_mut_ptr(), count);
            }
        }
        Ok(count)
    }

    /// Copy the whole one-dimensional view into an owned payload.
    pub fn contents(&self) -> Result<Bytes> {
        let len = self.len()?;
        let mut out = vec![0u8; len];
        let copied = self.read(&mut out, 0)?;
        debug_assert_eq!(copied, len);
        Ok(Bytes::from(out))
    }

    /// Copy `src` into the view at `offset`.
    ///
    /// Unlike [`read`](Self::read) this never clamps: a copy that does not
    /// fit fails with [`BridgeError::Bounds`] before any byte moves.
    /// Requires the foreign execution lock.
    pub fn write(&mut self, src: &[u8], offset: usize) -> Result<()> {
        debug_assert!(InterpLock::is_held(), "write requires the foreign lock");

        let desc = self.desc()?;
        self.require_flat(desc)?;

        if desc.read_only {
            return Err(BridgeError::ReadOnly);
        }
        let end = offset.checked_add(src.len());
        match end {
            Some(end) if end <= desc.len => {}
            _ => {
                return Err(BridgeError::Bounds {
                    offset,
                    count: src.len(),
                    len: desc.len,
                });
            }
        }

        if !src.is_empty() {
            // SAFETY: offset + src.len() <= desc.len (checked above), the
            // view is writable, and the lease plus the foreign lock keep
            // the region valid and unshared for the copy.
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), desc.base.add(offset), src.len());
            }
        }
        Ok(())
    }

    /// Delegate the contiguity test to the foreign side.
    pub fn is_contiguous(&self, order: Contiguity) -> Result<bool> {
        let desc = self.desc()?;
        Ok(self.abi.is_contiguous(desc, order))
    }

    /// Pointer to the item at `indices`.
    ///
    /// Version-gated on [`Feature::BufferPointer`]. Indices are validated
    /// against the declared shape before the foreign primitive runs.
    pub fn pointer_at(&self, indices: &[isize]) -> Result<*mut u8> {
        debug_assert!(InterpLock::is_held(), "pointer_at requires the foreign lock");

        let desc = self.desc()?;
        require_feature(self.abi.as_ref(), Feature::BufferPointer)?;

        if indices.len() != desc.ndim {
            return Err(BridgeError::UnsupportedShape { ndim: desc.ndim });
        }
        if let Some(shape) = &desc.shape {
            for (dim, (&index, &extent)) in indices.iter().zip(shape.iter()).enumerate() {
                if index < 0 || index >= extent {
                    return Err(BridgeError::Bounds {
                        offset: dim,
                        count: index.unsigned_abs(),
                        len: extent.max(0) as usize,
                    });
                }
            }
        }

        Ok(self.abi.buffer_pointer(desc, indices))
    }

    /// Copy the (possibly strided, any-dimensional) view into an owned
    /// contiguous payload of the given order.
    ///
    /// Version-gated on [`Feature::CopyToContiguous`].
    pub fn copy_to_contiguous(&self, order: Contiguity) -> Result<Bytes> {
        debug_assert!(InterpLock::is_held(), "copy requires the foreign lock");

        let desc = self.desc()?;
        require_feature(self.abi.as_ref(), Feature::CopyToContiguous)?;

        let mut out = vec![0u8; desc.len];
        self.abi.copy_to_contiguous(&mut out, desc, order);
        Ok(Bytes::from(out))
    }

    /// Fill the view from a contiguous source of exactly the view's length.
    ///
    /// Version-gated on [`Feature::CopyFromContiguous`].
    pub fn copy_from_contiguous(&mut self, src: &[u8], order: Contiguity) -> Result<()> {
        debug_assert!(InterpLock::is_held(), "copy requires the foreign lock");

        let desc = self.desc()?;
        require_feature(self.abi.as_ref(), Feature::CopyFromContiguous)?;

        if desc.read_only {
            return Err(BridgeError::ReadOnly);
        }
        if src.len() != desc.len {
            return Err(BridgeError::Bounds {
                offset: 0,
                count: src.len(),
                len: desc.len,
            });
        }

        self.abi.copy_from_contiguous(desc, src, order);
        Ok(())
    }

    /// Release the exporter's lease. Idempotent; the first call releases,
    /// later calls do nothing. Requires the foreign execution lock.
    pub fn close(&mut self) {
        if let Some(desc) = self.desc.take() {
            debug_assert!(InterpLock::is_held(), "close requires the foreign lock");
            self.abi.release_buffer(self.exporter, &desc);
            self.abi.decref(self.exporter);
            tracing::trace!("closed view on {:?}", self.exporter);
        }
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        if let Some(desc) = self.desc.take() {
            // Leak backstop only; the release runs at the next lock
            // acquisition. Explicit close is the documented path.
            log::warn!(
                "buffer view on {:?} dropped without close; deferring lease release",
                self.exporter
            );
            self.reclaim.defer(Reclaim::BufferLease {
                exporter: self.exporter,
                desc,
            });
        }
    }
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("BufferView");
        s.field("exporter", &self.exporter);
        match &self.desc {
            Some(desc) => s
                .field("len", &desc.len)
                .field("ndim", &desc.ndim)
                .field("read_only", &desc.read_only),
            None => s.field("state", &"closed"),
        };
        s.finish()
    }
}

/// Item size implied by a format string.
///
/// Version-gated on [`Feature::SizeFromFormat`].
pub fn size_from_format(abi: &dyn InterpAbi, format: &str) -> Result<usize> {
    require_feature(abi, Feature::SizeFromFormat)?;
    abi.size_from_format(format)
}

/// Strides describing a contiguous array of `shape` with `item_size`-byte
/// items in the given order.
///
/// Version-gated on [`Feature::FillContiguousStrides`].
pub fn contiguous_strides(
    abi: &dyn InterpAbi,
    shape: &[isize],
    item_size: isize,
    order: Contiguity,
) -> Result<Vec<isize>> {
    require_feature(abi, Feature::FillContiguousStrides)?;
    Ok(abi.contiguous_strides(shape, item_size, order))
}
