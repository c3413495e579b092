//! The profiling session: frame tree, record arena and ownership index for
//! one enable/disable cycle.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use crate::arena::{ArenaHooks, HeapRef};
use crate::buckets::{AllocRecord, Buckets};
use crate::config::{Config, ProfileFlags};
use crate::dump::{self, DumpFormat, FrameReport};
use crate::error::MemprofError;
use crate::frame::Frame;
use crate::hooks::HookInstaller;
use crate::index::OwnershipIndex;
use crate::native::NativeHooks;
use crate::tid;

static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// Handle for one call entry, passed back to [`Session::leave`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSite {
    epoch: u64,
    id: u64,
}

impl CallSite {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// A call that has been entered and not yet left. `caller` is the frame that
/// becomes current again when it leaves.
struct ActiveCall {
    id: u64,
    caller: NonNull<Frame>,
}

/// State of one profiling session.
///
/// The handler methods take the real allocator operation as a closure and
/// record its outcome. Only the thread that created the session gets new
/// records; frees and reallocations of tracked blocks are honoured from any
/// thread.
///
/// Most programs use the process-global session through
/// [`enable`](crate::enable). A `Session` can also be driven directly, e.g.
/// by a runtime that owns its own dispatch.
pub struct Session {
    config: Config,
    root: NonNull<Frame>,
    current: NonNull<Frame>,
    calls: Vec<ActiveCall>,
    next_call: u64,
    buckets: Buckets,
    index: OwnershipIndex,
    tracking: bool,
    owner: u64,
    epoch: u64,
    dumped: bool,
    hooks: Vec<Box<dyn HookInstaller>>,
}

// SAFETY: the frame tree and the records are owned by the session and only
// reached through `&mut Session`.
unsafe impl Send for Session {}

struct Retired {
    size: usize,
    frame: NonNull<Frame>,
}

impl Session {
    pub fn new(config: Config) -> Self {
        let root = Frame::new_root();
        Self {
            config,
            root,
            current: root,
            calls: Vec::new(),
            next_call: 0,
            buckets: Buckets::new(),
            index: OwnershipIndex::new(),
            tracking: true,
            owner: tid::current_tid(),
            epoch: NEXT_EPOCH.fetch_add(1, Ordering::Relaxed),
            dumped: false,
            hooks: Vec::new(),
        }
    }

    pub fn flags(&self) -> ProfileFlags {
        self.config.flags()
    }

    /// Unique per session. Frame guards use it to detect that the session
    /// they entered has been replaced.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_dumped(&self) -> bool {
        self.dumped
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    pub fn output_format(&self) -> DumpFormat {
        self.config.output_format
    }

    pub(crate) fn root(&self) -> &Frame {
        // SAFETY: the root lives as long as the session.
        unsafe { self.root.as_ref() }
    }

    /// Turns attribution of new allocations on or off. Returns the previous
    /// state.
    pub fn set_tracking(&mut self, tracking: bool) -> bool {
        std::mem::replace(&mut self.tracking, tracking)
    }

    #[inline]
    fn records_here(&self) -> bool {
        self.tracking && tid::current_tid() == self.owner
    }

    /// Installs the installers the config asks for.
    pub(crate) fn install_hooks(&mut self) {
        if self.config.native {
            self.add_hook(Box::new(NativeHooks::new()));
        }
        if let Some(slot) = self.config.arena {
            self.add_hook(Box::new(ArenaHooks::new(slot)));
        }
    }

    /// Installs `hook` now and uninstalls it when the session ends.
    pub fn add_hook(&mut self, mut hook: Box<dyn HookInstaller>) {
        hook.install();
        debug!(hook = hook.name(), "memprof: hooks installed");
        self.hooks.push(hook);
    }

    fn uninstall_hooks(&mut self) {
        while let Some(mut hook) = self.hooks.pop() {
            hook.uninstall();
            debug!(hook = hook.name(), "memprof: hooks uninstalled");
        }
    }

    /// The heap an arena installer replaced, if any.
    pub fn underlying_heap(&self) -> Option<HeapRef> {
        self.hooks.iter().find_map(|hook| hook.underlying_heap())
    }

    fn track(&mut self, ptr: *mut u8, size: usize, mut frame: NonNull<Frame>) {
        let record = self.buckets.acquire(size);
        // SAFETY: frames live until the session is dropped and the record is
        // fresh.
        unsafe { frame.as_mut().push_alloc(record) };
        if let Some(stale) = self.index.mark(ptr as usize, record) {
            self.discard(stale);
        }
    }

    fn discard(&mut self, record: NonNull<AllocRecord>) {
        // SAFETY: every record in the index is linked into a live frame.
        unsafe { Frame::unlink(record) };
        self.buckets.release(record);
    }

    fn retire(&mut self, ptr: *mut u8) -> Option<Retired> {
        let record = self.index.unmark(ptr as usize)?;
        // SAFETY: see `discard`.
        let retired = unsafe {
            let r = record.as_ref();
            Retired {
                size: r.size,
                frame: r.frame.unwrap_or(self.root),
            }
        };
        self.discard(record);
        Some(retired)
    }

    /// Size of the tracked block at `ptr`.
    pub fn tracked_size(&self, ptr: *const u8) -> Option<usize> {
        self.index
            .lookup(ptr as usize)
            // SAFETY: see `discard`.
            .map(|record| unsafe { record.as_ref().size })
    }

    /// Number of blocks currently attributed to some frame.
    pub fn tracked_blocks(&self) -> usize {
        self.index.len()
    }

    pub fn handle_alloc(&mut self, size: usize, real: impl FnOnce() -> *mut u8) -> *mut u8 {
        let ptr = real();
        if !ptr.is_null() && self.records_here() {
            self.track(ptr, size, self.current);
        }
        ptr
    }

    pub fn handle_aligned_alloc(
        &mut self,
        _alignment: usize,
        size: usize,
        real: impl FnOnce() -> *mut u8,
    ) -> *mut u8 {
        self.handle_alloc(size, real)
    }

    pub fn handle_free(&mut self, ptr: *mut u8, real: impl FnOnce(*mut u8)) {
        if ptr.is_null() {
            return;
        }
        self.retire(ptr);
        real(ptr);
    }

    /// `real` reallocates `ptr` to `new_size`.
    ///
    /// The old record is retired before `real` runs. On success the result is
    /// tracked at `new_size`; on failure `ptr` is tracked again at its old size
    /// in its old frame.
    pub fn handle_realloc(
        &mut self,
        ptr: *mut u8,
        new_size: usize,
        real: impl FnOnce() -> *mut u8,
    ) -> *mut u8 {
        if ptr.is_null() {
            return self.handle_alloc(new_size, real);
        }
        let Some(retired) = self.retire(ptr) else {
            return real();
        };

        let result = real();
        if result.is_null() {
            self.track(ptr, retired.size, retired.frame);
        } else {
            let frame = if self.records_here() {
                self.current
            } else {
                retired.frame
            };
            self.track(result, new_size, frame);
        }
        result
    }

    fn is_passthrough(&self, name: &str) -> bool {
        self.config.passthrough.iter().any(|p| &**p == name)
    }

    /// Call entry: makes the child `name` of the current frame current.
    /// Returns `None` when the call does not get a frame.
    pub fn enter(&mut self, name: &str) -> Option<CallSite> {
        if tid::current_tid() != self.owner || self.is_passthrough(name) {
            return None;
        }
        let tracking = self.set_tracking(false);
        let caller = self.current;
        // SAFETY: `current` always points into the tree.
        self.current = unsafe { self.current.as_mut() }.child(name);
        let id = self.next_call;
        self.next_call += 1;
        self.calls.push(ActiveCall { id, caller });
        self.set_tracking(tracking);
        Some(CallSite {
            epoch: self.epoch,
            id,
        })
    }

    /// Call exit for `site`.
    ///
    /// Calls may leave out of order, e.g. when measured futures are polled
    /// in turns. Leaving the innermost call makes its caller current again.
    /// Leaving an outer call keeps the current frame and hands the outer
    /// caller to the call entered just after it, so the innermost call still
    /// returns to a frame that is running. Sites from another session or
    /// ones already left are ignored.
    pub fn leave(&mut self, site: CallSite) {
        if site.epoch != self.epoch {
            return;
        }
        let Some(pos) = self.calls.iter().rposition(|call| call.id == site.id) else {
            return;
        };
        let left = self.calls.remove(pos);
        match self.calls.get_mut(pos) {
            Some(next) => next.caller = left.caller,
            None => self.current = left.caller,
        }
    }

    pub fn current_frame_name(&self) -> &str {
        // SAFETY: `current` always points into the tree.
        unsafe { self.current.as_ref() }.name()
    }

    pub fn dump_tree(&mut self) -> FrameReport {
        self.dumped = true;
        FrameReport::from_frame(self.root())
    }

    pub fn dump(&mut self, format: DumpFormat, out: &mut dyn Write) -> Result<(), MemprofError> {
        self.dumped = true;
        dump::write(format, self.root(), out).map_err(MemprofError::dump(format))
    }

    pub fn dump_to_file(&mut self, format: DumpFormat, path: &Path) -> Result<(), MemprofError> {
        self.dumped = true;
        let file = File::create(path).map_err(|source| MemprofError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let mut out = BufWriter::new(file);
        self.dump(format, &mut out)?;
        out.flush().map_err(MemprofError::dump(format))
    }

    /// A fresh file name in the configured output directory.
    pub fn output_path(&self, format: DumpFormat) -> PathBuf {
        dump::generate_filename(&self.config.output_dir, format, std::time::SystemTime::now())
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        use std::collections::HashSet;

        let mut linked = HashSet::new();
        self.root().walk(&mut |frame| {
            for record in frame.records() {
                assert!(linked.insert(record as *const AllocRecord));
            }
        });
        let indexed: HashSet<_> = self
            .index
            .records()
            .map(|r| r.as_ptr() as *const AllocRecord)
            .collect();
        assert_eq!(linked, indexed);
        assert_eq!(indexed.len(), self.index.len());
        assert_eq!(self.buckets.in_use(), self.index.len());
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.uninstall_hooks();

        let buckets = &mut self.buckets;
        // SAFETY: nothing else points into the tree once hooks are gone.
        unsafe { self.root.as_mut() }.drain_records(&mut |record| buckets.release(record));
        self.index.clear();
        unsafe { Frame::destroy_root(self.root) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn addr(n: usize) -> *mut u8 {
        (n * 0x10) as *mut u8
    }

    fn session() -> Session {
        Session::new(Config::new())
    }

    #[test]
    fn test_alloc_in_frame() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.handle_alloc(100, || addr(1));
        s.leave(a);

        let tree = s.dump_tree();
        let a = &tree.called_functions["a"];
        assert_eq!(a.memory_size, 100);
        assert_eq!(a.blocks_count, 1);
        assert_eq!(a.memory_size_inclusive, 100);
        assert_eq!(a.calls, 1);
        assert!(a.called_functions.is_empty());
        s.assert_consistent();
    }

    #[test]
    fn test_alloc_then_free() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.handle_alloc(50, || addr(1));
        s.leave(a);

        let freed = Cell::new(None);
        s.handle_free(addr(1), |p| freed.set(Some(p)));
        assert_eq!(freed.get(), Some(addr(1)));

        let a = &s.dump_tree().called_functions["a"];
        assert_eq!((a.memory_size, a.blocks_count), (0, 0));
        s.assert_consistent();
    }

    #[test]
    fn test_sibling_frames() {
        let mut s = session();
        for (i, name) in ["a", "b"].into_iter().enumerate() {
            let site = s.enter(name).unwrap();
            s.handle_alloc(10, || addr(i + 1));
            s.leave(site);
        }

        let tree = s.dump_tree();
        assert_eq!((tree.memory_size_inclusive, tree.blocks_count_inclusive), (20, 2));
        assert_eq!(tree.called_functions["a"].calls, 1);
        assert_eq!(tree.called_functions["b"].calls, 1);
    }

    #[test]
    fn test_frames_are_memoized() {
        let mut s = session();
        for _ in 0..3 {
            let a = s.enter("a").unwrap();
            let b = s.enter("b").unwrap();
            s.leave(b);
            s.leave(a);
        }

        let tree = s.dump_tree();
        assert_eq!(tree.called_functions.len(), 1);
        let a = &tree.called_functions["a"];
        assert_eq!(a.calls, 3);
        assert_eq!(a.called_functions.len(), 1);
        assert_eq!(a.called_functions["b"].calls, 3);
    }

    #[test]
    fn test_free_from_other_frame_debits_owner() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.handle_alloc(64, || addr(1));
        s.leave(a);
        let b = s.enter("b").unwrap();
        s.handle_free(addr(1), |_| {});
        s.leave(b);

        let tree = s.dump_tree();
        assert_eq!(tree.called_functions["a"].memory_size, 0);
        assert_eq!(tree.called_functions["b"].memory_size, 0);
    }

    #[test]
    fn test_realloc_moves_block() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.handle_alloc(10, || addr(1));
        let result = s.handle_realloc(addr(1), 40, || addr(2));
        s.leave(a);

        assert_eq!(result, addr(2));
        assert_eq!(s.tracked_size(addr(1)), None);
        assert_eq!(s.tracked_size(addr(2)), Some(40));
        assert_eq!(s.tracked_blocks(), 1);
        s.assert_consistent();
    }

    #[test]
    fn test_realloc_in_place() {
        let mut s = session();
        s.handle_alloc(10, || addr(1));
        s.handle_realloc(addr(1), 20, || addr(1));

        assert_eq!(s.tracked_size(addr(1)), Some(20));
        let tree = s.dump_tree();
        assert_eq!((tree.memory_size, tree.blocks_count), (20, 1));
        s.assert_consistent();
    }

    #[test]
    fn test_realloc_failure_keeps_original() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.handle_alloc(10, || addr(1));
        s.leave(a);
        let b = s.enter("b").unwrap();
        let result = s.handle_realloc(addr(1), 1 << 40, || std::ptr::null_mut());
        s.leave(b);

        assert!(result.is_null());
        assert_eq!(s.tracked_size(addr(1)), Some(10));
        let tree = s.dump_tree();
        assert_eq!(tree.called_functions["a"].memory_size, 10);
        assert_eq!(tree.called_functions["b"].memory_size, 0);
        s.assert_consistent();
    }

    #[test]
    fn test_realloc_null_allocates() {
        let mut s = session();
        s.handle_realloc(std::ptr::null_mut(), 8, || addr(3));
        assert_eq!(s.tracked_size(addr(3)), Some(8));
    }

    #[test]
    fn test_foreign_pointers_pass_through() {
        let mut s = session();
        s.handle_alloc(10, || addr(1));

        let freed = Cell::new(false);
        s.handle_free(addr(9), |_| freed.set(true));
        assert!(freed.get());

        let called = Cell::new(false);
        let result = s.handle_realloc(addr(8), 100, || {
            called.set(true);
            addr(7)
        });
        assert!(called.get());
        assert_eq!(result, addr(7));
        assert_eq!(s.tracked_size(addr(7)), None);
        assert_eq!(s.tracked_blocks(), 1);
        s.assert_consistent();
    }

    #[test]
    fn test_free_null_is_noop() {
        let mut s = session();
        let called = Cell::new(false);
        s.handle_free(std::ptr::null_mut(), |_| called.set(true));
        assert!(!called.get());
    }

    #[test]
    fn test_failed_alloc_not_tracked() {
        let mut s = session();
        assert!(s.handle_alloc(10, || std::ptr::null_mut()).is_null());
        assert_eq!(s.tracked_blocks(), 0);
    }

    #[test]
    fn test_tracking_disabled() {
        let mut s = session();
        s.set_tracking(false);
        s.handle_alloc(10, || addr(1));
        assert_eq!(s.tracked_blocks(), 0);

        s.set_tracking(true);
        s.handle_alloc(10, || addr(2));
        assert_eq!(s.tracked_blocks(), 1);
    }

    #[test]
    fn test_address_reuse_retires_stale_record() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.handle_alloc(10, || addr(1));
        s.leave(a);
        // The block was freed while interception was suspended; the address
        // comes back from the allocator.
        let b = s.enter("b").unwrap();
        s.handle_alloc(30, || addr(1));
        s.leave(b);

        let tree = s.dump_tree();
        assert_eq!(tree.called_functions["a"].memory_size, 0);
        assert_eq!(tree.called_functions["b"].memory_size, 30);
        assert_eq!(s.tracked_blocks(), 1);
        s.assert_consistent();
    }

    #[test]
    fn test_passthrough_calls_get_no_frame() {
        let mut s = Session::new(Config::new().passthrough(["invoke"]));
        s.enter("a").unwrap();
        assert!(s.enter("invoke").is_none());
        s.handle_alloc(10, || addr(1));

        let tree = s.dump_tree();
        let a = &tree.called_functions["a"];
        assert_eq!(a.memory_size, 10);
        assert!(a.called_functions.is_empty());
    }

    #[test]
    fn test_leave_twice_is_ignored() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        s.leave(a);
        s.leave(a);
        assert_eq!(s.current_frame_name(), "root");

        let other = session().enter("x").unwrap();
        s.enter("b").unwrap();
        s.leave(other);
        assert_eq!(s.current_frame_name(), "b");
    }

    #[test]
    fn test_out_of_order_leave_returns_to_live_caller() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        let b = s.enter("b").unwrap();

        // `a` finishes while `b` is still running.
        s.leave(a);
        assert_eq!(s.current_frame_name(), "b");
        s.handle_alloc(64, || addr(1));

        s.leave(b);
        assert_eq!(s.current_frame_name(), "root");
        s.handle_alloc(8, || addr(2));

        let tree = s.dump_tree();
        let a = &tree.called_functions["a"];
        assert_eq!(a.memory_size, 0);
        assert_eq!(a.called_functions["b"].memory_size, 64);
        assert_eq!(tree.memory_size, 8);
        s.assert_consistent();
    }

    #[test]
    fn test_aligned_alloc_in_frame() {
        let mut s = session();
        let a = s.enter("a").unwrap();
        let ptr = s.handle_aligned_alloc(64, 100, || addr(4));
        s.leave(a);

        assert_eq!(ptr, addr(4));
        assert_eq!(s.tracked_size(addr(4)), Some(100));
        let a = &s.dump_tree().called_functions["a"];
        assert_eq!((a.memory_size, a.blocks_count), (100, 1));
        s.assert_consistent();

        s.handle_free(addr(4), |_| {});
        assert_eq!(s.tracked_size(addr(4)), None);
        assert_eq!(s.tracked_blocks(), 0);
        s.assert_consistent();
    }

    #[test]
    fn test_other_threads_only_free() {
        let mut s = session();
        s.handle_alloc(10, || addr(1));

        std::thread::scope(|scope| {
            scope.spawn(|| {
                assert!(s.enter("worker").is_none());
                s.handle_alloc(99, || addr(2));
                s.handle_free(addr(1), |_| {});
            });
        });

        assert_eq!(s.tracked_blocks(), 0);
        assert!(s.dump_tree().called_functions.is_empty());
    }

    #[test]
    fn test_conservation() {
        let mut s = session();
        let mut n = 0;
        let mut alloc = |s: &mut Session, size| {
            n += 1;
            s.handle_alloc(size, || addr(n));
        };

        alloc(&mut s, 3);
        for outer in ["x", "y"] {
            let outer = s.enter(outer).unwrap();
            alloc(&mut s, 11);
            for inner in ["p", "q", "r"] {
                let inner = s.enter(inner).unwrap();
                alloc(&mut s, 7);
                alloc(&mut s, 5);
                s.leave(inner);
            }
            s.leave(outer);
        }

        let tree = s.dump_tree();
        let (mut bytes, mut blocks) = (tree.memory_size, tree.blocks_count);
        tree.visit(&mut |_, frame| {
            bytes += frame.memory_size;
            blocks += frame.blocks_count;
        });
        assert_eq!((bytes, blocks), (tree.memory_size_inclusive, tree.blocks_count_inclusive));
        assert_eq!((bytes, blocks), (3 + 2 * (11 + 3 * 12), 1 + 2 * (1 + 3 * 2)));
        s.assert_consistent();
    }

    #[test]
    fn test_many_records_survive_growth() {
        let mut s = session();
        for i in 1..=1000 {
            s.handle_alloc(i, || addr(i));
        }
        for i in (1..=1000).step_by(2) {
            s.handle_free(addr(i), |_| {});
        }
        assert_eq!(s.tracked_blocks(), 500);
        assert_eq!(s.tracked_size(addr(1000)), Some(1000));
        s.assert_consistent();
    }

    struct Recording {
        name: &'static str,
        log: Rc<std::cell::RefCell<Vec<String>>>,
    }

    // SAFETY: only used on the test thread.
    unsafe impl Send for Recording {}

    impl HookInstaller for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn install(&mut self) {
            self.log.borrow_mut().push(format!("install {}", self.name));
        }

        fn uninstall(&mut self) {
            self.log.borrow_mut().push(format!("uninstall {}", self.name));
        }
    }

    #[test]
    fn test_hooks_uninstalled_in_reverse_order() {
        let log = Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut s = session();
        for name in ["first", "second"] {
            s.add_hook(Box::new(Recording {
                name,
                log: log.clone(),
            }));
        }
        assert!(s.underlying_heap().is_none());
        drop(s);

        assert_eq!(
            *log.borrow(),
            ["install first", "install second", "uninstall second", "uninstall first"]
        );
    }
}
