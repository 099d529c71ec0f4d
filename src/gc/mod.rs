//! Deferred reclamation of foreign resources.
//!
//! ## Problem
//!
//! Releasing a foreign reference or a buffer lease requires the foreign
//! execution lock. A host object holding such a resource can be dropped by
//! the host's garbage collector on a thread that does not hold the lock.
//!
//! ## Solution
//!
//! Queue the release for later, then process the queue whenever the lock is
//! next acquired (in [`crate::lock::InterpLock`] construction).
//!
//! This path is a leak backstop only. The primary contract is explicit
//! scoped release (`BufferView::close`, `ObjectBridge::detach`); the queue
//! exists so a skipped close leaks nothing, not so callers can skip it.

mod reclaim;

pub use reclaim::{Reclaim, ReclaimQueue};
