//! Freelist arena for allocation records.
//!
//! Records are carved out of chunks obtained from [`System`] directly, so
//! acquiring one never re-enters the profiled allocator. Each growth doubles
//! the chunk size; slots are recycled through the freelist and only returned
//! to the system when the whole arena is dropped.

use std::alloc::{GlobalAlloc, Layout, System};
use std::mem;
use std::ptr::{self, NonNull};

use crate::fatal;
use crate::frame::Frame;

const INITIAL_GROW_SIZE: usize = 128;

#[cfg(debug_assertions)]
const CANARY: usize = 0x5a5a_5a5a;

/// One outstanding allocation, linked into exactly one frame's list.
#[derive(Clone, Copy)]
#[repr(C)]
pub(crate) struct AllocRecord {
    #[cfg(debug_assertions)]
    canary_a: usize,
    pub(crate) size: usize,
    pub(crate) prev: Option<NonNull<AllocRecord>>,
    pub(crate) next: Option<NonNull<AllocRecord>>,
    pub(crate) frame: Option<NonNull<Frame>>,
    #[cfg(debug_assertions)]
    canary_b: usize,
}

impl AllocRecord {
    fn new(size: usize) -> Self {
        Self {
            #[cfg(debug_assertions)]
            canary_a: size ^ CANARY,
            size,
            prev: None,
            next: None,
            frame: None,
            #[cfg(debug_assertions)]
            canary_b: size ^ CANARY,
        }
    }

    /// Aborts if the record was overwritten since it was handed out.
    #[inline]
    pub(crate) fn check(&self) {
        #[cfg(debug_assertions)]
        if self.canary_a != (self.size ^ CANARY) || self.canary_a != self.canary_b {
            eprintln!("memprof: canary mismatch for record {:p}", self);
            std::process::abort();
        }
    }
}

#[repr(C)]
union Slot {
    record: AllocRecord,
    next_free: Option<NonNull<Slot>>,
}

struct Bucket {
    slots: NonNull<Slot>,
    len: usize,
}

impl Bucket {
    fn layout(len: usize) -> Layout {
        let size = fatal::safe_size(len, mem::size_of::<Slot>(), 0);
        Layout::from_size_align(size, mem::align_of::<Slot>()).unwrap_or_else(|_| fatal::int_overflow())
    }
}

pub(crate) struct Buckets {
    grow_size: usize,
    nbuckets: usize,
    buckets: *mut Bucket,
    next_free: Option<NonNull<Slot>>,
    in_use: usize,
}

impl Buckets {
    pub(crate) fn new() -> Self {
        let mut buckets = Self {
            grow_size: INITIAL_GROW_SIZE,
            nbuckets: 0,
            buckets: ptr::null_mut(),
            next_free: None,
            in_use: 0,
        };
        buckets.grow();
        buckets
    }

    fn list_layout(nbuckets: usize) -> Layout {
        let size = fatal::safe_size(nbuckets, mem::size_of::<Bucket>(), 0);
        Layout::from_size_align(size, mem::align_of::<Bucket>()).unwrap_or_else(|_| fatal::int_overflow())
    }

    fn grow(&mut self) {
        let nbuckets = self.nbuckets.checked_add(1).unwrap_or_else(|| fatal::int_overflow());
        let new_list = Self::list_layout(nbuckets);

        // SAFETY: the list is either unallocated or was allocated by `System`
        // with the layout for `self.nbuckets` entries.
        let list = unsafe {
            if self.buckets.is_null() {
                System.alloc(new_list)
            } else {
                System.realloc(
                    self.buckets.cast::<u8>(),
                    Self::list_layout(self.nbuckets),
                    new_list.size(),
                )
            }
        };
        if list.is_null() {
            fatal::out_of_memory();
        }
        self.buckets = list.cast::<Bucket>();

        let grow_size = fatal::safe_size(2, self.grow_size, 0);
        // SAFETY: the layout has a non-zero size.
        let chunk = unsafe { System.alloc(Bucket::layout(grow_size)) };
        let Some(slots) = NonNull::new(chunk.cast::<Slot>()) else {
            fatal::out_of_memory();
        };

        // SAFETY: `slots` points to `grow_size` uninitialized slots and the
        // list has room for `nbuckets` entries.
        unsafe {
            for i in 0..grow_size - 1 {
                slots.add(i).write(Slot {
                    next_free: Some(slots.add(i + 1)),
                });
            }
            slots.add(grow_size - 1).write(Slot {
                next_free: self.next_free,
            });
            self.buckets.add(nbuckets - 1).write(Bucket {
                slots,
                len: grow_size,
            });
        }

        self.grow_size = grow_size;
        self.nbuckets = nbuckets;
        self.next_free = Some(slots);
    }

    /// Pops a slot off the freelist, growing the arena when it is empty.
    pub(crate) fn acquire(&mut self, size: usize) -> NonNull<AllocRecord> {
        let slot = match self.next_free {
            Some(slot) => slot,
            None => {
                self.grow();
                match self.next_free {
                    Some(slot) => slot,
                    None => fatal::out_of_memory(),
                }
            }
        };

        // SAFETY: slots on the freelist always hold the `next_free` variant.
        unsafe {
            self.next_free = slot.as_ref().next_free;
            slot.as_ptr().write(Slot {
                record: AllocRecord::new(size),
            });
        }
        self.in_use += 1;
        slot.cast::<AllocRecord>()
    }

    /// Pushes a record back on the freelist. The slot memory stays with the
    /// arena.
    pub(crate) fn release(&mut self, record: NonNull<AllocRecord>) {
        // SAFETY: `record` was handed out by `acquire` and is no longer used
        // by any frame.
        unsafe {
            record.as_ref().check();
            let slot = record.cast::<Slot>();
            slot.as_ptr().write(Slot {
                next_free: self.next_free,
            });
            self.next_free = Some(slot);
        }
        self.in_use -= 1;
    }

    /// Number of records currently handed out.
    #[cfg(test)]
    pub(crate) fn in_use(&self) -> usize {
        self.in_use
    }

    /// Total number of slots across all chunks.
    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        (0..self.nbuckets)
            // SAFETY: the first `nbuckets` list entries are initialized.
            .map(|i| unsafe { (*self.buckets.add(i)).len })
            .sum()
    }
}

impl Drop for Buckets {
    fn drop(&mut self) {
        if self.buckets.is_null() {
            return;
        }
        // SAFETY: every chunk and the list itself were allocated by `System`
        // with the layouts recomputed here.
        unsafe {
            for i in 0..self.nbuckets {
                let bucket = self.buckets.add(i).read();
                System.dealloc(bucket.slots.as_ptr().cast::<u8>(), Bucket::layout(bucket.len));
            }
            System.dealloc(self.buckets.cast::<u8>(), Self::list_layout(self.nbuckets));
        }
    }
}
