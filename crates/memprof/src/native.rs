//! Process allocator interception.
//!
//! [`MemprofAllocator`] wraps another [`GlobalAlloc`] (the system allocator by
//! default). It keeps process-wide usage counters for the host program and
//! forwards events to the session while [`NativeHooks`] are installed.
//! Allocations the profiler makes for itself are left out of the counters.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::hooks::{self, HookInstaller};

/// Largest alignment the platform `malloc` guarantees.
const MIN_ALIGN: usize = 2 * std::mem::size_of::<usize>();

static INSTALLED: AtomicBool = AtomicBool::new(false);

struct Usage {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Usage {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    #[inline]
    fn add(&self, size: usize) {
        let current = self.current.fetch_add(size, Ordering::Relaxed) + size;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    /// Saturates: a block the profiler allocated can be released by the host
    /// (e.g. a returned `FrameReport`), which was never added.
    #[inline]
    fn sub(&self, size: usize) {
        let _ = self
            .current
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(size))
            });
    }
}

/// Bytes requested by callers.
static REQUESTED: Usage = Usage::new();
/// Bytes including alignment padding.
static REAL: Usage = Usage::new();

// Both run after the handler has returned, so host blocks are counted whether
// or not a session recorded them.
#[inline]
fn account_alloc(layout: Layout) {
    if hooks::is_suspended() {
        return;
    }
    REQUESTED.add(layout.size());
    REAL.add(layout.pad_to_align().size());
}

#[inline]
fn account_dealloc(layout: Layout) {
    if hooks::is_suspended() {
        return;
    }
    REQUESTED.sub(layout.size());
    REAL.sub(layout.pad_to_align().size());
}

pub(crate) fn memory_usage(real: bool) -> usize {
    let usage = if real { &REAL } else { &REQUESTED };
    usage.current.load(Ordering::Relaxed)
}

pub(crate) fn peak_memory_usage(real: bool) -> usize {
    let usage = if real { &REAL } else { &REQUESTED };
    usage.peak.load(Ordering::Relaxed)
}

/// Global allocator that reports to the active profiling session.
///
/// Enabled automatically by the `native` feature. To wrap a different
/// allocator, disable the feature and register it yourself:
///
/// ```rust,ignore
/// #[global_allocator]
/// static GLOBAL: memprof::MemprofAllocator<mimalloc::MiMalloc> =
///     memprof::MemprofAllocator::new(mimalloc::MiMalloc);
/// ```
pub struct MemprofAllocator<A = System> {
    inner: A,
}

impl MemprofAllocator<System> {
    pub const fn system() -> Self {
        Self { inner: System }
    }
}

impl<A> MemprofAllocator<A> {
    pub const fn new(inner: A) -> Self {
        Self { inner }
    }
}

unsafe impl<A: GlobalAlloc> GlobalAlloc for MemprofAllocator<A> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let real = || unsafe { self.inner.alloc(layout) };
        let ptr = if !INSTALLED.load(Ordering::Relaxed) {
            real()
        } else if layout.align() > MIN_ALIGN {
            hooks::aligned_alloc(layout.align(), layout.size(), real)
        } else {
            hooks::alloc(layout.size(), real)
        };
        if !ptr.is_null() {
            account_alloc(layout);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let real = || unsafe { self.inner.alloc_zeroed(layout) };
        let ptr = if !INSTALLED.load(Ordering::Relaxed) {
            real()
        } else if layout.align() > MIN_ALIGN {
            hooks::aligned_alloc(layout.align(), layout.size(), real)
        } else {
            hooks::alloc(layout.size(), real)
        };
        if !ptr.is_null() {
            account_alloc(layout);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let real = |p: *mut u8| unsafe { self.inner.dealloc(p, layout) };
        if INSTALLED.load(Ordering::Relaxed) {
            hooks::free(ptr, real);
        } else {
            real(ptr);
        }
        account_dealloc(layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let real = || unsafe { self.inner.realloc(ptr, layout, new_size) };
        let new_ptr = if INSTALLED.load(Ordering::Relaxed) {
            hooks::realloc(ptr, new_size, real)
        } else {
            real()
        };
        if !new_ptr.is_null() {
            account_dealloc(layout);
            // SAFETY: `GlobalAlloc::realloc` requires the new layout to be valid.
            account_alloc(unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) });
        }
        new_ptr
    }
}

/// Routes the process allocator into the session.
#[derive(Debug, Default)]
pub struct NativeHooks {
    installed: bool,
}

impl NativeHooks {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HookInstaller for NativeHooks {
    fn name(&self) -> &'static str {
        "native"
    }

    fn install(&mut self) {
        #[cfg(not(feature = "native"))]
        tracing::debug!("memprof: `native` feature is off, native events are only seen through a registered MemprofAllocator");
        INSTALLED.store(true, Ordering::Release);
        self.installed = true;
    }

    fn uninstall(&mut self) {
        if self.installed {
            INSTALLED.store(false, Ordering::Release);
            self.installed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_accounts_usage() {
        let allocator = MemprofAllocator::system();
        let layout = Layout::from_size_align(100, 8).unwrap();

        let ptr = unsafe { allocator.alloc(layout) };
        assert!(!ptr.is_null());
        assert!(peak_memory_usage(false) >= 100);
        assert!(peak_memory_usage(true) >= 104);

        let ptr = unsafe { allocator.realloc(ptr, layout, 300) };
        assert!(!ptr.is_null());
        unsafe { allocator.dealloc(ptr, Layout::from_size_align(300, 8).unwrap()) };
    }

    #[test]
    fn test_profiler_allocations_not_accounted() {
        let allocator = MemprofAllocator::system();
        let layout = Layout::from_size_align(1 << 20, 8).unwrap();
        let before = memory_usage(false);

        let ptr = hooks::suspended(|| unsafe { allocator.alloc(layout) });
        assert!(!ptr.is_null());
        // other tests may allocate through the counters concurrently
        assert!(memory_usage(false) < before + (1 << 20));

        hooks::suspended(|| unsafe { allocator.dealloc(ptr, layout) });
        assert!(memory_usage(false) < before + (1 << 20));
    }

    #[test]
    fn test_usage_saturates_at_zero() {
        let usage = Usage::new();
        usage.add(10);
        usage.sub(25);
        assert_eq!(usage.current.load(Ordering::Relaxed), 0);
        assert_eq!(usage.peak.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_hooks_toggle_flag() {
        let mut hooks = NativeHooks::new();
        hooks.install();
        assert!(INSTALLED.load(Ordering::Acquire));
        hooks.uninstall();
        assert!(!INSTALLED.load(Ordering::Acquire));
        assert!(hooks.underlying_heap().is_none());
    }
}
