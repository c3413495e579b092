//! A memory profiler that attributes every live allocation to the call path
//! that made it, and exports the result in callgrind, pprof or JSON form.
//!
//! Instrument functions with [`measure`] (or blocks with [`measure_block!`]),
//! start a session with [`main`], [`MemprofBuilder`] or [`enable`], and dump
//! the frame tree before disabling it.
//!
//! Two levels of allocator events can be intercepted:
//!
//! - the process allocator, through [`MemprofAllocator`], registered as the
//!   global allocator by the `native` feature;
//! - a runtime's own heap published in a [`HeapSlot`], selected with
//!   [`Config::arena`].
//!
//! ```rust,no_run
//! #[memprof::measure]
//! fn build_index() -> Vec<String> {
//!     (0..1000).map(|i| i.to_string()).collect()
//! }
//!
//! fn main() {
//!     memprof::enable(memprof::Config::new().native(true)).unwrap();
//!     let index = build_index();
//!     memprof::dump_callgraph(&mut std::io::stdout()).unwrap();
//!     memprof::disable().unwrap();
//!     drop(index);
//! }
//! ```

mod arena;
mod buckets;
mod builder;
mod config;
mod dump;
mod error;
pub(crate) mod fatal;
mod frame;
mod guard;
mod hooks;
mod index;
mod native;
mod output;
mod profiler;
mod report;
mod session;
mod tid;

pub use arena::{ArenaHooks, Heap, HeapRef, HeapSlot, ProfiledHeap, SystemHeap};
pub use builder::{MemprofBuilder, MemprofGuard};
pub use config::{Config, ProfileFlags};
pub use dump::{DumpFormat, FrameReport};
pub use error::MemprofError;
pub use guard::FrameGuard;
pub use hooks::HookInstaller;
pub use memprof_macros::{main, measure, measure_all, skip};
pub use native::{MemprofAllocator, NativeHooks};
pub use output::{
    format_bytes, shorten_function_name, Format, FrameRow, ProfileReport, ReportJson, Reporter,
};
pub use profiler::{
    current_memory_usage, disable, dump, dump_callgraph, dump_samples, dump_to_file, dump_tree,
    enable, enabled_flags, is_enabled, on_fatal_error, peak_memory_usage, version,
    FatalErrorKind,
};
pub use report::reporter_for;
pub use session::{CallSite, Session};

cfg_if::cfg_if! {
    if #[cfg(feature = "native")] {
        #[global_allocator]
        static GLOBAL: MemprofAllocator = MemprofAllocator::system();
    }
}

/// Attributes the allocations of a block to the frame `$label`.
///
/// ```rust
/// let lines = memprof::measure_block!("read_lines", {
///     vec!["a".to_string(), "b".to_string()]
/// });
/// assert_eq!(lines.len(), 2);
/// ```
#[macro_export]
macro_rules! measure_block {
    ($label:expr, $expr:expr) => {{
        let _frame = $crate::FrameGuard::enter($label);

        $expr
    }};
}
