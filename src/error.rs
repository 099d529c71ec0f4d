//! Error taxonomy for bridge, buffer, and lifecycle operations.
//!
//! Buffer and registry misuse errors are recoverable: the offending view or
//! handle becomes unusable but no other state is affected. `Allocation` and
//! lifecycle-sequencing failures are fatal by policy, because a foreign
//! object may already hold a cross-runtime reference that cannot be safely
//! revoked once the bridge is half-torn-down.

use crate::abi::InterpVersion;
use thiserror::Error;

/// Errors produced by bridge, buffer view, and lifecycle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The exporter object does not implement the buffer protocol.
    #[error("exporter does not support the buffer protocol")]
    Protocol,

    /// The exporter implements the protocol but cannot satisfy the
    /// requested view flags (e.g. a writable view of a read-only exporter).
    #[error("buffer negotiation failed: {0}")]
    Negotiation(String),

    /// A copy would run past the exporter-declared bounds.
    #[error("write of {count} bytes at offset {offset} exceeds view length {len}")]
    Bounds {
        offset: usize,
        count: usize,
        len: usize,
    },

    /// Write attempted through a read-only view.
    #[error("buffer view is read-only")]
    ReadOnly,

    /// Flat byte copies are only defined for one-dimensional contiguous
    /// views; the exporter declared something else.
    #[error("operation requires a one-dimensional contiguous view (exporter has {ndim} dimension(s))")]
    UnsupportedShape { ndim: usize },

    /// The view was already closed.
    #[error("buffer view used after close")]
    UseAfterClose,

    /// The handle or bridge was already drained by shutdown.
    #[error("bridge handle used after shutdown")]
    UseAfterShutdown,

    /// A version-gated primitive was called against an interpreter that
    /// predates it.
    #[error("{feature} requires interpreter {required} or newer (embedded interpreter is {actual})")]
    UnsupportedByInterpreter {
        feature: &'static str,
        required: InterpVersion,
        actual: InterpVersion,
    },

    /// Native identity allocation failed. Fatal: the process cannot safely
    /// continue once slot allocation fails mid-bridge.
    #[error("native identity allocation failed")]
    Allocation,
}

pub type Result<T> = std::result::Result<T, BridgeError>;
