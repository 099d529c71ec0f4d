pub mod abi;
pub mod bridge;
pub mod buffer;
pub mod error;
pub mod gc;
pub mod lifecycle;
pub mod lock;
pub mod object;
pub mod persist;
pub mod registry;

// Core API
pub use bridge::{ObjectBridge, TrackedHandle};
pub use buffer::{contiguous_strides, size_from_format, BufferView};
pub use error::{BridgeError, Result};
pub use lifecycle::{LifecycleState, ModuleBinding, Session, ShutdownMode};
pub use lock::InterpLock;
pub use object::{BridgedObject, Visitor};
pub use registry::{HandleRegistry, Tracking};

// Foreign-surface types consumed and exposed by the core
pub use abi::{
    view_flags, Contiguity, Feature, ForeignTypeId, InterpAbi, InterpBaseline, InterpVersion,
    NativeId, RawBufferDesc, ReleaseHook, WellKnown,
};
