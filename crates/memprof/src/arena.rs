//! Arena-level interception.
//!
//! A runtime that manages its own heap publishes it through a [`HeapSlot`]
//! and allocates via the slot. While a session with
//! [`Config::arena`](crate::Config::arena) is active, the slot holds a
//! [`ProfiledHeap`] that reports every event to the session before
//! delegating to the original heap.

use std::alloc::{GlobalAlloc, Layout, System};
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::hooks::{self, HookInstaller};

/// A runtime's internal allocator.
pub trait Heap: Send + Sync {
    /// Returns null on failure.
    fn allocate(&self, size: usize) -> *mut u8;

    fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this heap.
    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8;

    /// # Safety
    ///
    /// `ptr` must be null or a live block returned by this heap.
    unsafe fn free(&self, ptr: *mut u8);

    /// Bytes in use. `real` includes the heap's own overhead.
    fn memory_usage(&self, real: bool) -> usize;

    fn peak_memory_usage(&self, real: bool) -> usize;

    fn memory_limit(&self) -> usize;

    fn set_memory_limit(&self, limit: usize);
}

pub type HeapRef = Arc<Box<dyn Heap>>;

/// The swappable location a runtime allocates through.
pub struct HeapSlot {
    heap: ArcSwap<Box<dyn Heap>>,
}

impl HeapSlot {
    pub fn new(heap: impl Heap + 'static) -> Self {
        let heap: Box<dyn Heap> = Box::new(heap);
        Self {
            heap: ArcSwap::from_pointee(heap),
        }
    }

    /// The heap currently installed.
    pub fn get(&self) -> HeapRef {
        self.heap.load_full()
    }

    /// Installs `heap` and returns the previous one.
    pub fn replace(&self, heap: HeapRef) -> HeapRef {
        self.heap.swap(heap)
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.heap.load().allocate(size)
    }

    pub fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        self.heap.load().allocate_aligned(alignment, size)
    }

    /// # Safety
    ///
    /// See [`Heap::reallocate`].
    pub unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.heap.load().reallocate(ptr, size) }
    }

    /// # Safety
    ///
    /// See [`Heap::free`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        unsafe { self.heap.load().free(ptr) }
    }

    pub fn memory_usage(&self, real: bool) -> usize {
        self.heap.load().memory_usage(real)
    }

    pub fn memory_limit(&self) -> usize {
        self.heap.load().memory_limit()
    }

    pub fn set_memory_limit(&self, limit: usize) {
        self.heap.load().set_memory_limit(limit)
    }
}

impl fmt::Debug for HeapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapSlot")
            .field("memory_usage", &self.memory_usage(false))
            .field("memory_limit", &self.memory_limit())
            .finish()
    }
}

/// Wraps a heap and reports its events to the active session.
pub struct ProfiledHeap {
    inner: HeapRef,
}

impl ProfiledHeap {
    pub fn new(inner: HeapRef) -> Self {
        Self { inner }
    }
}

impl Heap for ProfiledHeap {
    fn allocate(&self, size: usize) -> *mut u8 {
        hooks::alloc(size, || self.inner.allocate(size))
    }

    fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        hooks::aligned_alloc(alignment, size, || self.inner.allocate_aligned(alignment, size))
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        hooks::realloc(ptr, size, || unsafe { self.inner.reallocate(ptr, size) })
    }

    unsafe fn free(&self, ptr: *mut u8) {
        hooks::free(ptr, |p| unsafe { self.inner.free(p) })
    }

    fn memory_usage(&self, real: bool) -> usize {
        self.inner.memory_usage(real)
    }

    fn peak_memory_usage(&self, real: bool) -> usize {
        self.inner.peak_memory_usage(real)
    }

    fn memory_limit(&self) -> usize {
        self.inner.memory_limit()
    }

    fn set_memory_limit(&self, limit: usize) {
        self.inner.set_memory_limit(limit)
    }
}

/// Swaps a [`ProfiledHeap`] into a slot for the lifetime of a session.
pub struct ArenaHooks {
    slot: &'static HeapSlot,
    original: Option<HeapRef>,
}

impl ArenaHooks {
    pub fn new(slot: &'static HeapSlot) -> Self {
        Self {
            slot,
            original: None,
        }
    }
}

impl HookInstaller for ArenaHooks {
    fn name(&self) -> &'static str {
        "arena"
    }

    fn install(&mut self) {
        let original = self.slot.get();
        let profiled: Box<dyn Heap> = Box::new(ProfiledHeap::new(original.clone()));
        self.slot.replace(Arc::new(profiled));
        self.original = Some(original);
    }

    fn uninstall(&mut self) {
        if let Some(original) = self.original.take() {
            self.slot.replace(original);
        }
    }

    fn underlying_heap(&self) -> Option<HeapRef> {
        self.original.clone()
    }
}

const HEADER: usize = 16;

/// A [`Heap`] over the system allocator with usage accounting and a memory
/// limit. Allocations beyond the limit fail with a null pointer.
///
/// Each block carries a 16 byte header holding its size and offset from the
/// start of the underlying allocation.
pub struct SystemHeap {
    requested: AtomicUsize,
    real: AtomicUsize,
    peak_requested: AtomicUsize,
    peak_real: AtomicUsize,
    limit: AtomicUsize,
}

impl SystemHeap {
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            requested: AtomicUsize::new(0),
            real: AtomicUsize::new(0),
            peak_requested: AtomicUsize::new(0),
            peak_real: AtomicUsize::new(0),
            limit: AtomicUsize::new(limit),
        }
    }

    fn layout(size: usize, alignment: usize) -> Option<(Layout, usize)> {
        let align = alignment.max(HEADER).checked_next_power_of_two()?;
        let offset = align.max(HEADER);
        let layout = Layout::from_size_align(offset.checked_add(size)?, align).ok()?;
        Some((layout, offset))
    }

    fn reserve(&self, size: usize, real: usize) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        let reserved = self
            .real
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                used.checked_add(real).filter(|total| *total <= limit)
            });
        if reserved.is_err() {
            return false;
        }
        let requested = self.requested.fetch_add(size, Ordering::Relaxed) + size;
        self.peak_requested.fetch_max(requested, Ordering::Relaxed);
        self.peak_real
            .fetch_max(self.real.load(Ordering::Relaxed), Ordering::Relaxed);
        true
    }

    fn unreserve(&self, size: usize, real: usize) {
        self.requested.fetch_sub(size, Ordering::Relaxed);
        self.real.fetch_sub(real, Ordering::Relaxed);
    }

    fn alloc_block(&self, alignment: usize, size: usize) -> *mut u8 {
        let Some((layout, offset)) = Self::layout(size, alignment) else {
            return ptr::null_mut();
        };
        if !self.reserve(size, layout.size()) {
            return ptr::null_mut();
        }
        // SAFETY: the layout is never zero-sized.
        let base = unsafe { System.alloc(layout) };
        if base.is_null() {
            self.unreserve(size, layout.size());
            return ptr::null_mut();
        }
        // SAFETY: `offset >= HEADER` bytes precede the returned pointer.
        unsafe {
            let ptr = base.add(offset);
            let header = ptr.sub(HEADER).cast::<[usize; 2]>();
            header.write_unaligned([size, offset]);
            ptr
        }
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    unsafe fn header(ptr: *mut u8) -> (usize, usize) {
        let [size, offset] = unsafe { ptr.sub(HEADER).cast::<[usize; 2]>().read_unaligned() };
        (size, offset)
    }

    /// # Safety
    ///
    /// `ptr` must be a live block of this heap.
    unsafe fn block_layout(ptr: *mut u8) -> (usize, usize, Layout) {
        let (size, offset) = unsafe { Self::header(ptr) };
        // SAFETY: this layout was valid when the block was allocated.
        let layout = unsafe { Layout::from_size_align_unchecked(offset + size, offset) };
        (size, offset, layout)
    }
}

impl Default for SystemHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap for SystemHeap {
    fn allocate(&self, size: usize) -> *mut u8 {
        self.alloc_block(HEADER, size)
    }

    fn allocate_aligned(&self, alignment: usize, size: usize) -> *mut u8 {
        self.alloc_block(alignment, size)
    }

    unsafe fn reallocate(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.allocate(size);
        }
        let (old_size, offset, _) = unsafe { Self::block_layout(ptr) };
        let new = self.alloc_block(offset, size);
        if new.is_null() {
            return new;
        }
        // SAFETY: both blocks are live and distinct.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_size.min(size));
            self.free(ptr);
        }
        new
    }

    unsafe fn free(&self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }
        let (size, offset, layout) = unsafe { Self::block_layout(ptr) };
        self.unreserve(size, layout.size());
        unsafe { System.dealloc(ptr.sub(offset), layout) };
    }

    fn memory_usage(&self, real: bool) -> usize {
        if real {
            self.real.load(Ordering::Relaxed)
        } else {
            self.requested.load(Ordering::Relaxed)
        }
    }

    fn peak_memory_usage(&self, real: bool) -> usize {
        if real {
            self.peak_real.load(Ordering::Relaxed)
        } else {
            self.peak_requested.load(Ordering::Relaxed)
        }
    }

    fn memory_limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    fn set_memory_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }
}
