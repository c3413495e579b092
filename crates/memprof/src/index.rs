use std::collections::HashMap;
use std::ptr::NonNull;

use crate::buckets::AllocRecord;
use crate::fatal;

/// Maps the address of every tracked block to its record.
///
/// Table growth goes through whatever allocator is registered globally; the
/// profiler always calls into the index with interception suspended, so the
/// growth is passed straight to the real allocator.
#[derive(Default)]
pub(crate) struct OwnershipIndex {
    entries: HashMap<usize, NonNull<AllocRecord>>,
}

impl OwnershipIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Associates `addr` with `record` and returns the record it displaced,
    /// if any.
    pub(crate) fn mark(
        &mut self,
        addr: usize,
        record: NonNull<AllocRecord>,
    ) -> Option<NonNull<AllocRecord>> {
        if self.entries.try_reserve(1).is_err() {
            fatal::out_of_memory();
        }
        self.entries.insert(addr, record)
    }

    pub(crate) fn lookup(&self, addr: usize) -> Option<NonNull<AllocRecord>> {
        self.entries.get(&addr).copied()
    }

    pub(crate) fn unmark(&mut self, addr: usize) -> Option<NonNull<AllocRecord>> {
        self.entries.remove(&addr)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn records(&self) -> impl Iterator<Item = NonNull<AllocRecord>> + '_ {
        self.entries.values().copied()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::Buckets;

    #[test]
    fn test_mark_lookup_unmark() {
        let mut buckets = Buckets::new();
        let mut index = OwnershipIndex::new();
        let record = buckets.acquire(16);

        assert!(index.mark(0x1000, record).is_none());
        assert_eq!(index.lookup(0x1000), Some(record));
        assert_eq!(index.lookup(0x2000), None);
        assert_eq!(index.len(), 1);

        assert_eq!(index.unmark(0x1000), Some(record));
        assert_eq!(index.unmark(0x1000), None);
        assert_eq!(index.len(), 0);

        buckets.release(record);
    }

    #[test]
    fn test_mark_returns_displaced_record() {
        let mut buckets = Buckets::new();
        let mut index = OwnershipIndex::new();
        let stale = buckets.acquire(8);
        let fresh = buckets.acquire(24);

        index.mark(0x40, stale);
        assert_eq!(index.mark(0x40, fresh), Some(stale));
        assert_eq!(index.lookup(0x40), Some(fresh));

        buckets.release(stale);
        buckets.release(fresh);
    }
}
