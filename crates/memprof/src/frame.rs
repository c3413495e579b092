//! The call-frame tree.
//!
//! Frames are keyed by name under their parent, so repeated calls along the
//! same path share one frame. Every frame owns an intrusive list of the
//! records allocated while it was current.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::AddAssign;
use std::ptr::{self, NonNull};

use crate::buckets::AllocRecord;

pub(crate) const ROOT_NAME: &str = "root";

/// Bytes and block count of a set of allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Cost {
    pub(crate) bytes: usize,
    pub(crate) blocks: usize,
}

impl AddAssign for Cost {
    fn add_assign(&mut self, other: Self) {
        self.bytes += other.bytes;
        self.blocks += other.blocks;
    }
}

pub(crate) struct Frame {
    name: Box<str>,
    /// The root is its own parent.
    parent: NonNull<Frame>,
    children: HashMap<Box<str>, Box<Frame>>,
    calls: u64,
    allocs: Option<NonNull<AllocRecord>>,
}

impl Frame {
    fn new(name: Box<str>, parent: NonNull<Frame>) -> Self {
        Self {
            name,
            parent,
            children: HashMap::new(),
            calls: 0,
            allocs: None,
        }
    }

    /// Allocates a root frame. Release it with [`Frame::destroy_root`].
    pub(crate) fn new_root() -> NonNull<Frame> {
        let root = Box::into_raw(Box::new(Frame::new(ROOT_NAME.into(), NonNull::dangling())));
        // SAFETY: `root` was just produced by `Box::into_raw`.
        unsafe {
            (*root).parent = NonNull::new_unchecked(root);
            (*root).calls = 1;
            NonNull::new_unchecked(root)
        }
    }

    /// # Safety
    ///
    /// `root` must come from [`Frame::new_root`], and no pointer into the
    /// tree may be used afterwards.
    pub(crate) unsafe fn destroy_root(root: NonNull<Frame>) {
        drop(unsafe { Box::from_raw(root.as_ptr()) });
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn calls(&self) -> u64 {
        self.calls
    }

    pub(crate) fn is_root(&self) -> bool {
        ptr::eq(self.parent.as_ptr(), self)
    }

    /// Returns the child called `name`, creating it on first use, and counts
    /// one more call into it.
    pub(crate) fn child(&mut self, name: &str) -> NonNull<Frame> {
        if let Some(child) = self.children.get_mut(name) {
            child.calls += 1;
            return NonNull::from(&mut **child);
        }

        let parent = NonNull::from(&mut *self);
        let mut child = Box::new(Frame::new(name.into(), parent));
        child.calls = 1;
        let ptr = NonNull::from(&mut *child);
        self.children.insert(name.into(), child);
        ptr
    }

    #[cfg(test)]
    pub(crate) fn get_child(&self, name: &str) -> Option<&Frame> {
        self.children.get(name).map(|c| &**c)
    }

    /// Children ordered by name.
    pub(crate) fn sorted_children(&self) -> Vec<&Frame> {
        let mut children: Vec<&Frame> = self.children.values().map(|c| &**c).collect();
        children.sort_unstable_by(|a, b| a.name.cmp(&b.name));
        children
    }

    pub(crate) fn records(&self) -> Records<'_> {
        Records {
            next: self.allocs,
            _frame: PhantomData,
        }
    }

    pub(crate) fn self_cost(&self) -> Cost {
        let mut cost = Cost::default();
        for record in self.records() {
            cost.bytes += record.size;
            cost.blocks += 1;
        }
        cost
    }

    #[cfg(test)]
    pub(crate) fn inclusive_cost(&self) -> Cost {
        let mut cost = self.self_cost();
        for child in self.children.values() {
            cost += child.inclusive_cost();
        }
        cost
    }

    /// This frame and its parents, stopping before the root.
    pub(crate) fn ancestors(&self) -> Ancestors<'_> {
        Ancestors { next: Some(self) }
    }

    pub(crate) fn stack_depth(&self) -> usize {
        self.ancestors().count()
    }

    /// Visits every frame below and including this one, parents first,
    /// siblings by name.
    #[cfg(test)]
    pub(crate) fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Frame)) {
        f(self);
        for child in self.sorted_children() {
            child.walk(f);
        }
    }

    /// Links `record` at the head of this frame's list.
    ///
    /// # Safety
    ///
    /// `record` must be a live record that is not linked into any frame.
    pub(crate) unsafe fn push_alloc(&mut self, mut record: NonNull<AllocRecord>) {
        let this = NonNull::from(&mut *self);
        unsafe {
            let r = record.as_mut();
            r.prev = None;
            r.next = self.allocs;
            r.frame = Some(this);
            if let Some(mut head) = self.allocs {
                head.as_mut().prev = Some(record);
            }
        }
        self.allocs = Some(record);
    }

    /// Removes `record` from the list of the frame that owns it.
    ///
    /// # Safety
    ///
    /// `record` must be linked into a frame that is still alive.
    pub(crate) unsafe fn unlink(mut record: NonNull<AllocRecord>) {
        unsafe {
            let r = record.as_mut();
            r.check();
            match r.prev {
                Some(mut prev) => prev.as_mut().next = r.next,
                None => {
                    if let Some(mut frame) = r.frame {
                        frame.as_mut().allocs = r.next;
                    }
                }
            }
            if let Some(mut next) = r.next {
                next.as_mut().prev = r.prev;
            }
            r.prev = None;
            r.next = None;
            r.frame = None;
        }
    }

    /// Detaches every record in the subtree and hands it to `release`.
    pub(crate) fn drain_records(&mut self, release: &mut impl FnMut(NonNull<AllocRecord>)) {
        let mut next = self.allocs.take();
        while let Some(record) = next {
            // SAFETY: records in the list stay valid until released.
            next = unsafe { record.as_ref().next };
            release(record);
        }
        for child in self.children.values_mut() {
            child.drain_records(release);
        }
    }
}

pub(crate) struct Records<'a> {
    next: Option<NonNull<AllocRecord>>,
    _frame: PhantomData<&'a Frame>,
}

impl<'a> Iterator for Records<'a> {
    type Item = &'a AllocRecord;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.next?;
        // SAFETY: the list is only mutated through `&mut Frame`, which cannot
        // coexist with the borrow held by this iterator.
        let r = unsafe { record.as_ref() };
        self.next = r.next;
        Some(r)
    }
}

pub(crate) struct Ancestors<'a> {
    next: Option<&'a Frame>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a Frame;

    fn next(&mut self) -> Option<Self::Item> {
        let frame = self.next.filter(|f| !f.is_root())?;
        // SAFETY: parents outlive their children.
        self.next = Some(unsafe { frame.parent.as_ref() });
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buckets::Buckets;

    struct Tree {
        root: NonNull<Frame>,
        buckets: Buckets,
    }

    impl Tree {
        fn new() -> Self {
            Self {
                root: Frame::new_root(),
                buckets: Buckets::new(),
            }
        }

        fn root(&mut self) -> &mut Frame {
            unsafe { self.root.as_mut() }
        }

        fn alloc(&mut self, mut frame: NonNull<Frame>, size: usize) -> NonNull<AllocRecord> {
            let record = self.buckets.acquire(size);
            unsafe { frame.as_mut().push_alloc(record) };
            record
        }

        fn free(&mut self, record: NonNull<AllocRecord>) {
            unsafe { Frame::unlink(record) };
            self.buckets.release(record);
        }
    }

    impl Drop for Tree {
        fn drop(&mut self) {
            let buckets = &mut self.buckets;
            unsafe { self.root.as_mut() }.drain_records(&mut |r| buckets.release(r));
            unsafe { Frame::destroy_root(self.root) };
        }
    }

    #[test]
    fn test_root_is_own_parent() {
        let mut tree = Tree::new();
        let root = tree.root();
        assert!(root.is_root());
        assert_eq!(root.name(), ROOT_NAME);
        assert_eq!(root.calls(), 1);
        assert_eq!(root.stack_depth(), 0);
    }

    #[test]
    fn test_child_is_memoized() {
        let mut tree = Tree::new();
        let first = tree.root().child("a");
        let second = tree.root().child("a");
        assert_eq!(first, second);
        assert_eq!(unsafe { first.as_ref() }.calls(), 2);
        assert_eq!(tree.root().sorted_children().len(), 1);
    }

    #[test]
    fn test_stack_depth_and_ancestors() {
        let mut tree = Tree::new();
        let mut a = tree.root().child("a");
        let mut b = unsafe { a.as_mut() }.child("b");
        let c = unsafe { b.as_mut() }.child("c");

        let c = unsafe { c.as_ref() };
        assert_eq!(c.stack_depth(), 3);
        let names: Vec<_> = c.ancestors().map(Frame::name).collect();
        assert_eq!(names, ["c", "b", "a"]);
        assert!(!c.is_root());
    }

    #[test]
    fn test_sorted_children() {
        let mut tree = Tree::new();
        for name in ["zeta", "alpha", "mid"] {
            tree.root().child(name);
        }
        let names: Vec<_> = tree.root().sorted_children().into_iter().map(Frame::name).collect();
        assert_eq!(names, ["alpha", "mid", "zeta"]);
    }

    #[test]
    fn test_self_and_inclusive_cost() {
        let mut tree = Tree::new();
        let root = tree.root;
        let a = tree.root().child("a");
        let b = unsafe { (*a.as_ptr()).child("b") };

        tree.alloc(root, 1);
        tree.alloc(a, 10);
        tree.alloc(a, 20);
        tree.alloc(b, 300);

        let a_ref = unsafe { a.as_ref() };
        assert_eq!(a_ref.self_cost(), Cost { bytes: 30, blocks: 2 });
        assert_eq!(a_ref.inclusive_cost(), Cost { bytes: 330, blocks: 3 });
        assert_eq!(tree.root().inclusive_cost(), Cost { bytes: 331, blocks: 4 });
    }

    #[test]
    fn test_unlink_head_middle_tail() {
        let mut tree = Tree::new();
        let a = tree.root().child("a");
        let first = tree.alloc(a, 1);
        let second = tree.alloc(a, 2);
        let third = tree.alloc(a, 4);

        tree.free(second);
        assert_eq!(unsafe { a.as_ref() }.self_cost(), Cost { bytes: 5, blocks: 2 });
        tree.free(third);
        assert_eq!(unsafe { a.as_ref() }.self_cost(), Cost { bytes: 1, blocks: 1 });
        tree.free(first);
        assert_eq!(unsafe { a.as_ref() }.self_cost(), Cost::default());
        assert_eq!(tree.buckets.in_use(), 0);
    }

    #[test]
    fn test_walk_visits_parents_first() {
        let mut tree = Tree::new();
        let mut b = tree.root().child("b");
        unsafe { b.as_mut() }.child("c");
        tree.root().child("a");

        let mut names = Vec::new();
        unsafe { tree.root.as_ref() }.walk(&mut |f| names.push(f.name().to_string()));
        assert_eq!(names, ["root", "a", "b", "c"]);
    }
}
