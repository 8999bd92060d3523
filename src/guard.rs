//! Shared-state guard
//!
//! The configuration, cached register values, smoothing states and the
//! register store live in one [`Workspace`] behind a reentrant lock.
//!
//! Acquisition contract:
//! - The calculation cycle takes the lock with an unbounded wait
//!   ([`SharedState::lock_for_cycle`]) and marks itself in progress while
//!   it holds it.
//! - Administrative mutation ([`SharedState::try_acquire_admin`]) first
//!   raises the pause request, waits up to `cycle_wait` for a running cycle
//!   to finish, then tries the lock for `lock_timeout`. On timeout it fails
//!   with [`GuardError::Busy`] instead of blocking. The pause request is
//!   withdrawn when the returned guard (or the error) is dropped.
//! - The cycle-finished wait is best effort: a cycle may start between the
//!   wait and the lock attempt, in which case the attempt times out as busy.
//!
//! The lock is reentrant so an operation that already holds it can call
//! helpers that lock again. Access to the workspace goes through the
//! short-lived [`WorkspaceGuard::read`] and [`WorkspaceGuard::write`]
//! closures; a closure must not lock the state again itself.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::calc::smoothing::SmoothingBank;
use crate::calc::RegisterIndex;
use crate::config::{Configuration, DeviceConfig, GuardConfig, RegisterConfig};
use crate::modbus::RegisterStore;

/// Interval between checks of the cycle-in-progress flag
const CYCLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("system busy, try again")]
    Busy,
}

/// Everything the cycle and the administrative layer share
pub struct Workspace {
    pub config: Configuration,
    pub filters: SmoothingBank,
    pub store: Box<dyn RegisterStore>,
}

impl Workspace {
    pub fn new(config: Configuration, store: Box<dyn RegisterStore>) -> Self {
        Self {
            config,
            filters: SmoothingBank::new(),
            store,
        }
    }

    pub fn device(&self, device: usize) -> Option<&DeviceConfig> {
        self.config.devices.get(device)
    }

    pub fn register(&self, index: RegisterIndex) -> Option<&RegisterConfig> {
        self.device(index.device)
            .and_then(|d| d.registers.get(index.register))
    }

    /// Swap in a new configuration; cached values and smoothing restart
    pub fn replace_config(&mut self, config: Configuration) {
        self.config = config;
        self.filters.reset_all();
    }
}

/// Guard timing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardTiming {
    /// How long an administrative request waits for a running cycle
    pub cycle_wait: Duration,
    /// Lock attempt timeout for administrative requests
    pub lock_timeout: Duration,
}

impl Default for GuardTiming {
    fn default() -> Self {
        Self::from(&GuardConfig::default())
    }
}

impl From<&GuardConfig> for GuardTiming {
    fn from(config: &GuardConfig) -> Self {
        Self {
            cycle_wait: Duration::from_millis(config.cycle_wait_ms),
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
        }
    }
}

/// Shared-state handle, usually held in an `Arc`
pub struct SharedState {
    workspace: ReentrantMutex<RefCell<Workspace>>,
    pause_requests: AtomicUsize,
    cycle_in_progress: AtomicBool,
    timing: GuardTiming,
}

impl SharedState {
    pub fn new(workspace: Workspace, timing: GuardTiming) -> Self {
        Self {
            workspace: ReentrantMutex::new(RefCell::new(workspace)),
            pause_requests: AtomicUsize::new(0),
            cycle_in_progress: AtomicBool::new(false),
            timing,
        }
    }

    pub fn timing(&self) -> GuardTiming {
        self.timing
    }

    /// Whether an administrative request is waiting or running
    pub fn pause_requested(&self) -> bool {
        self.pause_requests.load(Ordering::Acquire) > 0
    }

    pub fn cycle_in_progress(&self) -> bool {
        self.cycle_in_progress.load(Ordering::Acquire)
    }

    /// Lock with an unbounded wait
    pub fn lock(&self) -> WorkspaceGuard<'_> {
        WorkspaceGuard {
            inner: self.workspace.lock(),
        }
    }

    /// Lock with a bounded wait
    pub fn try_lock_for(&self, timeout: Duration) -> Option<WorkspaceGuard<'_>> {
        self.workspace
            .try_lock_for(timeout)
            .map(|inner| WorkspaceGuard { inner })
    }

    /// Lock for one calculation cycle
    pub fn lock_for_cycle(&self) -> CycleGuard<'_> {
        let guard = self.lock();
        self.cycle_in_progress.store(true, Ordering::Release);
        CycleGuard {
            guard,
            _flag: CycleFlag(&self.cycle_in_progress),
        }
    }

    /// Acquire for administrative mutation using the pause protocol
    pub fn try_acquire_admin(&self) -> Result<AdminGuard<'_>, GuardError> {
        let pause = PauseRequest::new(&self.pause_requests);

        let deadline = Instant::now() + self.timing.cycle_wait;
        while self.cycle_in_progress() && Instant::now() < deadline {
            std::thread::sleep(CYCLE_POLL_INTERVAL);
        }
        if self.cycle_in_progress() {
            debug!(
                "Cycle still running after {:?}, trying lock anyway",
                self.timing.cycle_wait
            );
        }

        match self.try_lock_for(self.timing.lock_timeout) {
            Some(guard) => Ok(AdminGuard {
                guard,
                _pause: pause,
            }),
            None => {
                warn!(
                    "Shared state busy after {:?}, administrative request rejected",
                    self.timing.lock_timeout
                );
                Err(GuardError::Busy)
            }
        }
    }
}

/// Held lock on the workspace
pub struct WorkspaceGuard<'a> {
    inner: ReentrantMutexGuard<'a, RefCell<Workspace>>,
}

impl WorkspaceGuard<'_> {
    pub fn read<R>(&self, f: impl FnOnce(&Workspace) -> R) -> R {
        f(&self.inner.borrow())
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut Workspace) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }
}

/// Clears the cycle-in-progress flag on drop
struct CycleFlag<'a>(&'a AtomicBool);

impl Drop for CycleFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Withdraws one pause request on drop
struct PauseRequest<'a>(&'a AtomicUsize);

impl<'a> PauseRequest<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for PauseRequest<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lock held by the calculation cycle
///
/// Field order matters: the lock is released before the flag is cleared.
pub struct CycleGuard<'a> {
    guard: WorkspaceGuard<'a>,
    _flag: CycleFlag<'a>,
}

impl<'a> Deref for CycleGuard<'a> {
    type Target = WorkspaceGuard<'a>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

/// Lock held by an administrative operation
///
/// Field order matters: the lock is released before the pause request is
/// withdrawn.
pub struct AdminGuard<'a> {
    guard: WorkspaceGuard<'a>,
    _pause: PauseRequest<'a>,
}

impl<'a> Deref for AdminGuard<'a> {
    type Target = WorkspaceGuard<'a>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}
