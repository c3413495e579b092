//! Dispatch from intercepted events to the active session.
//!
//! Every entry point here is reached from inside an allocator, so the rule
//! is: check the per-thread suspension flag first, and if it is set go
//! straight to the real allocator. Otherwise set it for the duration of the
//! handler. Anything the profiler allocates for itself (index growth, frame
//! names, dump formatting, log lines) therefore bypasses bookkeeping.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::arena::HeapRef;
use crate::error::MemprofError;
use crate::session::{CallSite, Session};

static SESSION: Mutex<Option<Session>> = Mutex::new(None);

/// Mirrors `SESSION.is_some()` so idle handlers skip the lock.
static ACTIVE: AtomicBool = AtomicBool::new(false);

thread_local! {
    static SUSPENDED: Cell<bool> = const { Cell::new(false) };
}

/// A way of routing one level of allocator events into the session.
///
/// Installers are owned by the session: `install` runs when it is enabled and
/// `uninstall` when it is torn down, in reverse order.
pub trait HookInstaller: Send {
    fn name(&self) -> &'static str;

    fn install(&mut self);

    fn uninstall(&mut self);

    /// The heap that was in place before `install`, used for memory usage
    /// queries. Only arena-level installers have one.
    fn underlying_heap(&self) -> Option<HeapRef> {
        None
    }
}

/// Suspends interception on the current thread until dropped.
pub(crate) struct Suspended {
    previous: bool,
}

impl Suspended {
    #[inline]
    pub(crate) fn enter() -> Self {
        Self {
            previous: SUSPENDED.with(|s| s.replace(true)),
        }
    }
}

impl Drop for Suspended {
    #[inline]
    fn drop(&mut self) {
        SUSPENDED.with(|s| s.set(self.previous));
    }
}

/// Whether the current thread is inside a handler or other profiler
/// bookkeeping.
#[inline]
pub(crate) fn is_suspended() -> bool {
    SUSPENDED.with(Cell::get)
}

#[inline]
fn bypass() -> bool {
    !ACTIVE.load(Ordering::Acquire) || is_suspended()
}

fn lock() -> MutexGuard<'static, Option<Session>> {
    SESSION.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs `f` with interception suspended on this thread.
pub(crate) fn suspended<R>(f: impl FnOnce() -> R) -> R {
    let _suspended = Suspended::enter();
    f()
}

/// Runs `f` against the active session.
pub(crate) fn with_session<R>(f: impl FnOnce(&mut Session) -> R) -> Result<R, MemprofError> {
    let _suspended = Suspended::enter();
    let mut slot = lock();
    slot.as_mut().map(f).ok_or(MemprofError::NotEnabled)
}

pub(crate) fn start(session: Session) -> Result<(), MemprofError> {
    let _suspended = Suspended::enter();
    let mut slot = lock();
    if slot.is_some() {
        return Err(MemprofError::AlreadyEnabled);
    }
    *slot = Some(session);
    if let Some(session) = slot.as_mut() {
        session.install_hooks();
    }
    ACTIVE.store(true, Ordering::Release);
    Ok(())
}

pub(crate) fn stop() -> Result<Session, MemprofError> {
    let _suspended = Suspended::enter();
    let mut slot = lock();
    let session = slot.take().ok_or(MemprofError::NotEnabled)?;
    ACTIVE.store(false, Ordering::Release);
    Ok(session)
}

pub(crate) fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

#[inline]
pub(crate) fn alloc(size: usize, real: impl FnOnce() -> *mut u8) -> *mut u8 {
    if bypass() {
        return real();
    }
    let _suspended = Suspended::enter();
    let mut slot = lock();
    match slot.as_mut() {
        Some(session) => session.handle_alloc(size, real),
        None => real(),
    }
}

#[inline]
pub(crate) fn aligned_alloc(
    alignment: usize,
    size: usize,
    real: impl FnOnce() -> *mut u8,
) -> *mut u8 {
    if bypass() {
        return real();
    }
    let _suspended = Suspended::enter();
    let mut slot = lock();
    match slot.as_mut() {
        Some(session) => session.handle_aligned_alloc(alignment, size, real),
        None => real(),
    }
}

#[inline]
pub(crate) fn realloc(ptr: *mut u8, new_size: usize, real: impl FnOnce() -> *mut u8) -> *mut u8 {
    if bypass() {
        return real();
    }
    let _suspended = Suspended::enter();
    let mut slot = lock();
    match slot.as_mut() {
        Some(session) => session.handle_realloc(ptr, new_size, real),
        None => real(),
    }
}

#[inline]
pub(crate) fn free(ptr: *mut u8, real: impl FnOnce(*mut u8)) {
    if bypass() {
        return real(ptr);
    }
    let _suspended = Suspended::enter();
    let mut slot = lock();
    match slot.as_mut() {
        Some(session) => session.handle_free(ptr, real),
        None => real(ptr),
    }
}

/// Call entry. Returns the site to leave when a frame was pushed.
pub(crate) fn enter_frame(name: &str) -> Option<CallSite> {
    if bypass() {
        return None;
    }
    let _suspended = Suspended::enter();
    let mut slot = lock();
    slot.as_mut()?.enter(name)
}

/// Call exit. Ignored when the session that saw the entry is gone.
pub(crate) fn leave_frame(site: CallSite) {
    if !is_active() {
        return;
    }
    let _suspended = Suspended::enter();
    let mut slot = lock();
    if let Some(session) = slot.as_mut().filter(|s| s.epoch() == site.epoch()) {
        session.leave(site);
    }
}
