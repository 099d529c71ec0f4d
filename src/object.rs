//! Host-side counterpart objects surfaced to the foreign interpreter.

use crate::abi::NativeId;

/// Visitor passed through cooperative cycle-collection traversal. Receives
/// the native identity of every foreign slot the object refers to.
pub type Visitor<'a> = dyn FnMut(NativeId) + 'a;

/// A host object that has (or may be given) a counterpart foreign slot.
///
/// The bridge never interprets the object itself; it only keeps it alive
/// while the counterpart slot lives and forwards the foreign collector's
/// traverse/clear requests here. The foreign-type layer above this core
/// supplies the two callbacks; the default no-ops are correct for objects
/// that hold no foreign references of their own.
pub trait BridgedObject: Send + Sync {
    /// Report every foreign slot this object refers to, so that reference
    /// cycles spanning both object models are collectible.
    fn traverse(&self, _visit: &mut Visitor<'_>) {}

    /// Drop this object's foreign references to break a detected cycle.
    fn clear(&self) {}
}
