//! Session lifecycle: initialize, shutdown, soft shutdown, reload.
//!
//! The session is the process-wide owner of the bridge's operational mode.
//! Its state machine runs `Uninitialized → Running → Draining → Shutdown`,
//! with `Shutdown → Running` (a reload restore, or a fresh initialize after
//! a normal shutdown) as the sole cycle. Exactly one session may be Running
//! in a process at a time; the claim is a guard, not ambient state, and all
//! collaborators (registry, bridge, reclaim queue) are owned and injected by
//! the session rather than reached through statics.
//!
//! Initialization and shutdown are not interruptible. A failure partway
//! through either sequence is fatal to the process: once a foreign object
//! holds a cross-runtime reference, half-initialized bridge state cannot be
//! safely unwound, so these paths panic with a clear diagnostic instead of
//! returning partial state.
//!
//! Lifecycle transitions must not be raced with in-flight bridge or buffer
//! calls on other threads; callers sequence shutdown after their last use,
//! exactly as they would for the raw interpreter.

use crate::abi::{InterpAbi, InterpBaseline, NativeId, WellKnown};
use crate::bridge::ObjectBridge;
use crate::buffer::BufferView;
use crate::error::{BridgeError, Result};
use crate::gc::ReclaimQueue;
use crate::lock::InterpLock;
use crate::persist::{StashedObject, StashedState};
use crate::registry::{HandleRegistry, TrackedRecord, Tracking};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Environment toggle: default the shutdown mode to Soft.
pub const ENV_SOFT_SHUTDOWN: &str = "HOSTLINK_SOFT_SHUTDOWN";
/// Environment toggle: default the shutdown mode to Reload.
pub const ENV_RELOAD: &str = "HOSTLINK_RELOAD";

/// Operational state of the session.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LifecycleState {
    Uninitialized,
    Running,
    Draining,
    Shutdown,
}

/// What `shutdown` does to the embedded interpreter.
///
/// `Normal` finalizes it (irreversible for that interpreter). `Soft` keeps
/// it alive and restores the pre-initialize baseline so a later initialize
/// reuses it cleanly. `Reload` keeps it alive and stashes bridge-held state
/// so the next initialize reconstructs the bridge instead of starting fresh.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ShutdownMode {
    Normal,
    Soft,
    Reload,
}

/// A named module the host installed into the interpreter. The session owns
/// one foreign reference per binding.
#[derive(Clone, Debug)]
pub struct ModuleBinding {
    pub name: String,
    pub handle: NativeId,
}

/// Process-wide claim backing the one-Running-session invariant.
static RUNNING_CLAIM: AtomicBool = AtomicBool::new(false);

fn claim_running() {
    if RUNNING_CLAIM
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        panic!("another bridge session is already running in this process");
    }
}

fn release_running_claim() {
    RUNNING_CLAIM.store(false, Ordering::Release);
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

/// Shutdown mode when the caller passes none: `HOSTLINK_RELOAD` wins over
/// `HOSTLINK_SOFT_SHUTDOWN`, and `Normal` is the fallback.
pub fn default_shutdown_mode() -> ShutdownMode {
    if env_flag(ENV_RELOAD) {
        ShutdownMode::Reload
    } else if env_flag(ENV_SOFT_SHUTDOWN) {
        ShutdownMode::Soft
    } else {
        ShutdownMode::Normal
    }
}

const STATE_UNINITIALIZED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_SHUTDOWN: u8 = 3;

fn encode_state(state: LifecycleState) -> u8 {
    match state {
        LifecycleState::Uninitialized => STATE_UNINITIALIZED,
        LifecycleState::Running => STATE_RUNNING,
        LifecycleState::Draining => STATE_DRAINING,
        LifecycleState::Shutdown => STATE_SHUTDOWN,
    }
}

fn decode_state(raw: u8) -> LifecycleState {
    match raw {
        STATE_UNINITIALIZED => LifecycleState::Uninitialized,
        STATE_RUNNING => LifecycleState::Running,
        STATE_DRAINING => LifecycleState::Draining,
        STATE_SHUTDOWN => LifecycleState::Shutdown,
        _ => unreachable!("corrupt lifecycle state {raw}"),
    }
}

const MODE_NORMAL: u8 = 0;
const MODE_SOFT: u8 = 1;
const MODE_RELOAD: u8 = 2;

fn encode_mode(mode: ShutdownMode) -> u8 {
    match mode {
        ShutdownMode::Normal => MODE_NORMAL,
        ShutdownMode::Soft => MODE_SOFT,
        ShutdownMode::Reload => MODE_RELOAD,
    }
}

fn decode_mode(raw: u8) -> ShutdownMode {
    match raw {
        MODE_NORMAL => ShutdownMode::Normal,
        MODE_SOFT => ShutdownMode::Soft,
        MODE_RELOAD => ShutdownMode::Reload,
        _ => unreachable!("corrupt shutdown mode {raw}"),
    }
}

/// State behind the session's lifecycle mutex: everything only touched by
/// the (serialized) lifecycle operations themselves.
struct SessionInner {
    baseline: Option<InterpBaseline>,
    wellknown: Vec<(WellKnown, NativeId)>,
    modules: Vec<ModuleBinding>,
    stash: Option<StashedState>,
}

/// The bridge's lifecycle controller and component owner.
///
/// Construct once with the interpreter's primitive surface, then drive it
/// through `initialize`/`shutdown`. Bridge and buffer operations hang off
/// [`bridge`](Session::bridge) and [`open_view`](Session::open_view).
pub struct Session {
    abi: Arc<dyn InterpAbi>,
    registry: Arc<HandleRegistry>,
    bridge: Arc<ObjectBridge>,
    reclaim: Arc<ReclaimQueue>,
    state: AtomicU8,
    mode: AtomicU8,
    inner: Mutex<SessionInner>,
}

impl Session {
    /// Create a session over the given interpreter surface. No foreign
    /// state is touched until `initialize`.
    pub fn new(abi: Arc<dyn InterpAbi>) -> Self {
        let registry = Arc::new(HandleRegistry::new());
        let bridge = Arc::new(ObjectBridge::new(Arc::clone(&abi), Arc::clone(&registry)));
        Self {
            abi,
            registry,
            bridge,
            reclaim: Arc::new(ReclaimQueue::new()),
            state: AtomicU8::new(STATE_UNINITIALIZED),
            mode: AtomicU8::new(MODE_NORMAL),
            inner: Mutex::new(SessionInner {
                baseline: None,
                wellknown: Vec::new(),
                modules: Vec::new(),
                stash: None,
            }),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    /// Shutdown mode this session was initialized with.
    pub fn current_mode(&self) -> ShutdownMode {
        decode_mode(self.mode.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// The object bridge. Always available; it answers with
    /// [`BridgeError::UseAfterShutdown`] outside a Running session.
    pub fn bridge(&self) -> Arc<ObjectBridge> {
        Arc::clone(&self.bridge)
    }

    /// The interpreter's primitive surface this session was built over.
    pub fn abi(&self) -> &Arc<dyn InterpAbi> {
        &self.abi
    }

    /// Acquire the foreign execution lock as a scoped guard, draining any
    /// deferred releases first. The core never takes this lock implicitly;
    /// every bridge or buffer operation expects the caller to hold it.
    pub fn lock(&self) -> InterpLock {
        InterpLock::acquire(Arc::clone(&self.abi), &self.reclaim)
    }

    /// Releases queued by lock-less drops, still waiting for a lock
    /// acquisition.
    pub fn pending_reclaims(&self) -> u64 {
        self.reclaim.len()
    }

    /// Bring the bridge up.
    ///
    /// No-op if already Running. The effective mode is the explicit
    /// argument, else the environment default, else Normal. For `Soft` and
    /// `Reload` the interpreter baseline is captured so shutdown can
    /// restore it. When a reload stash is pending from a prior shutdown it
    /// is popped and replayed instead of fresh setup.
    ///
    /// Must be called without the foreign lock held; the sequence scopes it
    /// internally.
    pub fn initialize(&self, mode: Option<ShutdownMode>) -> Result<()> {
        debug_assert!(
            !InterpLock::is_held(),
            "initialize acquires the foreign lock itself"
        );

        let mut inner = self.inner.lock().expect("session state poisoned");
        match self.state() {
            LifecycleState::Running => {
                log::debug!("initialize: session already running");
                return Ok(());
            }
            LifecycleState::Draining => {
                panic!("initialize called while a shutdown drain is in progress");
            }
            LifecycleState::Uninitialized | LifecycleState::Shutdown => {}
        }
        claim_running();

        let mode = mode.unwrap_or_else(default_shutdown_mode);
        let restoring = inner.stash.is_some();
        log::info!(
            "initializing bridge session (mode {:?}{})",
            mode,
            if restoring { ", restoring stash" } else { "" }
        );

        self.abi.init_threading();

        let lock = InterpLock::acquire(Arc::clone(&self.abi), &self.reclaim);

        // Route the foreign dealloc path into the bridge for the life of
        // the session. Weak: the hook must not keep the bridge alive.
        let bridge = Arc::downgrade(&self.bridge);
        self.abi.set_release_hook(Arc::new(move |id| {
            if let Some(bridge) = bridge.upgrade() {
                bridge.release(id);
            }
        }));

        // Pre-initialize snapshot, so Soft can roll the interpreter back.
        // A restore pops the baseline from the stash instead; the live
        // interpreter is no longer in its pristine state.
        if !restoring && matches!(mode, ShutdownMode::Soft | ShutdownMode::Reload) {
            inner.baseline = Some(self.abi.stash_baseline());
        }

        self.abi.install_import_hook();

        inner.wellknown = WellKnown::ALL
            .iter()
            .map(|&which| {
                let id = self.abi.wellknown(which);
                self.abi.incref(id);
                (which, id)
            })
            .collect();

        self.bridge.revive();

        if let Some(mut stash) = inner.stash.take() {
            self.restore_stash(&mut inner, &mut stash);
        }

        drop(lock);

        self.mode.store(encode_mode(mode), Ordering::Release);
        self.state.store(STATE_RUNNING, Ordering::Release);
        log::info!("bridge session running");
        Ok(())
    }

    /// Replay a reload stash into the revived bridge. Runs under the
    /// foreign lock.
    fn restore_stash(&self, inner: &mut SessionInner, stash: &mut StashedState) {
        let interp = self.abi.version();
        if stash.version != interp {
            panic!(
                "reload stash was made by interpreter {} but {} is embedded; \
                 cannot safely reattach foreign objects",
                stash.version, interp
            );
        }

        let objects = std::mem::take(&mut stash.objects);
        let modules = std::mem::take(&mut stash.modules);
        let baseline = stash.baseline.take();
        let restored = objects.len();

        for object in objects {
            let StashedObject {
                id,
                type_id,
                tracking,
                host,
            } = object;
            self.registry.insert(
                id,
                TrackedRecord {
                    host,
                    type_id,
                    tracking,
                },
            );
            if tracking == Tracking::Extension {
                // The bridge resumes lifetime bookkeeping for the slot.
                self.abi.gc_untrack(id);
            }
            // Drop the keep-alive reference the stash held through the
            // teardown; the foreign side's own references carry it now.
            self.abi.decref(id);
        }

        log::info!(
            "restored {} tracked object(s) and {} module binding(s) from reload stash",
            restored,
            modules.len()
        );
        inner.modules = modules;
        inner.baseline = baseline;
    }

    /// Bring the bridge down: Running → Draining → Shutdown.
    ///
    /// Under `Reload` the bridge-held state is stashed first; then module
    /// bindings and the import hook are torn down, the bridge drains, the
    /// well-known cache is released, and the mode branch runs: `Normal`
    /// finalizes the interpreter, `Soft` and `Reload` force a collection
    /// pass, `Soft` additionally restoring the pre-initialize baseline.
    ///
    /// Calling outside a Running session is a logged no-op. Must be called
    /// without the foreign lock held.
    pub fn shutdown(&self) -> Result<()> {
        debug_assert!(
            !InterpLock::is_held(),
            "shutdown acquires the foreign lock itself"
        );

        let mut inner = self.inner.lock().expect("session state poisoned");
        if self.state() != LifecycleState::Running {
            log::warn!("shutdown ignored in state {:?}", self.state());
            return Ok(());
        }
        let mode = self.current_mode();
        self.state.store(STATE_DRAINING, Ordering::Release);
        log::info!("shutting down bridge session (mode {:?})", mode);

        let lock = InterpLock::acquire(Arc::clone(&self.abi), &self.reclaim);

        if mode == ShutdownMode::Reload {
            self.build_stash(&mut inner);
        }

        // Host-installed modules and the import hook go before the drain;
        // nothing may import through the bridge once draining starts.
        for binding in inner.modules.drain(..) {
            self.abi.decref(binding.handle);
        }
        self.abi.remove_import_hook();

        self.bridge.drain();
        debug_assert!(self.registry.is_empty());

        for (_, id) in inner.wellknown.drain(..) {
            self.abi.decref(id);
        }

        match mode {
            ShutdownMode::Normal => {
                self.abi.finalize();
                log::info!("interpreter finalized");
            }
            ShutdownMode::Soft => {
                self.abi.collect();
                if let Some(baseline) = inner.baseline.take() {
                    // Memory-state restore only; the next initialize
                    // re-runs import-hook and cache setup itself.
                    self.abi.restore_baseline(baseline);
                }
            }
            ShutdownMode::Reload => {
                self.abi.collect();
            }
        }

        drop(lock);

        self.state.store(STATE_SHUTDOWN, Ordering::Release);
        release_running_claim();
        log::info!("bridge session shut down");
        Ok(())
    }

    /// Serialize bridge-held state that must survive the teardown. Runs
    /// under the foreign lock, before the drain empties the registry.
    fn build_stash(&self, inner: &mut SessionInner) {
        let objects: Vec<StashedObject> = self
            .registry
            .snapshot()
            .into_iter()
            .map(|(id, record)| {
                // Ownership of the slot transfers to the stash for the
                // teardown window, so the drain cannot free it.
                self.abi.incref(id);
                StashedObject {
                    id,
                    type_id: record.type_id,
                    tracking: record.tracking,
                    host: record.host,
                }
            })
            .collect();

        // The session's module references move into the stash unchanged.
        let modules = std::mem::take(&mut inner.modules);

        log::info!(
            "stashed {} tracked object(s) and {} module binding(s) for reload",
            objects.len(),
            modules.len()
        );
        inner.stash = Some(StashedState::new(
            self.abi.version(),
            inner.baseline.take(),
            modules,
            objects,
            Arc::clone(&self.reclaim),
        ));
    }

    /// Open a buffer view over a foreign exporter. Requires a Running
    /// session and the foreign execution lock.
    pub fn open_view(&self, exporter: NativeId, flags: u32) -> Result<BufferView> {
        if !self.is_running() {
            return Err(BridgeError::UseAfterShutdown);
        }
        BufferView::open(
            Arc::clone(&self.abi),
            Arc::clone(&self.reclaim),
            exporter,
            flags,
        )
    }

    /// Record a module the host installed into the interpreter, taking one
    /// foreign reference for the session. The binding is torn down at
    /// shutdown and survives a reload cycle through the stash.
    ///
    /// Requires a Running session and the foreign execution lock.
    pub fn bind_module(&self, name: &str, handle: NativeId) -> Result<()> {
        debug_assert!(
            InterpLock::is_held(),
            "bind_module requires the foreign lock"
        );
        if !self.is_running() {
            return Err(BridgeError::UseAfterShutdown);
        }

        let mut inner = self.inner.lock().expect("session state poisoned");
        self.abi.incref(handle);
        if let Some(existing) = inner.modules.iter_mut().find(|b| b.name == name) {
            log::warn!("module binding {name:?} replaced");
            self.abi.decref(existing.handle);
            existing.handle = handle;
        } else {
            inner.modules.push(ModuleBinding {
                name: name.to_owned(),
                handle,
            });
        }
        tracing::trace!("bound module {:?} to {:?}", name, handle);
        Ok(())
    }

    /// The module bindings currently installed.
    pub fn module_bindings(&self) -> Vec<ModuleBinding> {
        self.inner
            .lock()
            .expect("session state poisoned")
            .modules
            .clone()
    }

    /// Cached identity of a well-known foreign object, if the session is
    /// Running.
    pub fn wellknown(&self, which: WellKnown) -> Option<NativeId> {
        self.inner
            .lock()
            .expect("session state poisoned")
            .wellknown
            .iter()
            .find(|(w, _)| *w == which)
            .map(|(_, id)| *id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.is_running() {
            // No drain here: foreign objects may still reference host
            // objects, and unwinding that requires the caller-driven
            // shutdown sequence.
            log::error!("session dropped while running; shutdown() was never called");
            release_running_claim();
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("mode", &self.current_mode())
            .field("tracked", &self.registry.len())
            .finish()
    }
}
