//! The process-global profiling session.

use std::borrow::Cow;
use std::io::Write;
use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::{Config, ProfileFlags};
use crate::dump::{DumpFormat, FrameReport};
use crate::error::MemprofError;
use crate::hooks;
use crate::native;
use crate::session::Session;

/// Kinds of fatal host errors passed to [`on_fatal_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FatalErrorKind {
    /// The host ran into its memory limit.
    MemoryLimit,
    Other,
}

/// Starts profiling the calling thread.
///
/// Allocations made before this call are never attributed, and frees of
/// those blocks are passed through untouched.
pub fn enable(config: Config) -> Result<(), MemprofError> {
    let session = hooks::suspended(|| Session::new(config));
    let flags = session.flags();
    hooks::start(session)?;
    hooks::suspended(|| debug!(?flags, "memprof: enabled"));
    Ok(())
}

/// Stops profiling and releases every record.
pub fn disable() -> Result<(), MemprofError> {
    let session = hooks::stop()?;
    hooks::suspended(|| {
        if !session.is_dumped() {
            warn!(
                "memprof was enabled, but no profile was dumped. \
                 Call one of dump_callgraph(), dump_samples() or dump_tree() before disable()"
            );
        }
        drop(session);
        debug!("memprof: disabled");
    });
    Ok(())
}

pub fn is_enabled() -> bool {
    hooks::is_active()
}

/// Flags of the active session, or all `false` when none is active.
pub fn enabled_flags() -> ProfileFlags {
    hooks::with_session(|s| s.flags()).unwrap_or_default()
}

/// The frame tree as a nested structure, rooted at the `root` frame.
pub fn dump_tree() -> Result<FrameReport, MemprofError> {
    hooks::with_session(Session::dump_tree)
}

/// Writes the tree to `out` in callgrind format.
pub fn dump_callgraph(out: &mut dyn Write) -> Result<(), MemprofError> {
    dump(DumpFormat::Callgraph, out)
}

/// Writes the tree to `out` in pprof format.
pub fn dump_samples(out: &mut dyn Write) -> Result<(), MemprofError> {
    dump(DumpFormat::Samples, out)
}

pub fn dump(format: DumpFormat, out: &mut dyn Write) -> Result<(), MemprofError> {
    hooks::with_session(|s| s.dump(format, out))?
}

/// Writes the tree to a fresh file in the configured output directory and
/// returns its path.
pub fn dump_to_file(format: DumpFormat) -> Result<PathBuf, MemprofError> {
    hooks::with_session(|s| {
        let path = s.output_path(format);
        s.dump_to_file(format, &path).map(|()| path)
    })?
}

/// Memory in use by the host, excluding the profiler's own bookkeeping.
///
/// With an intercepted arena this is the arena's own accounting. Otherwise it
/// is what went through [`MemprofAllocator`](crate::MemprofAllocator);
/// `real` includes alignment padding.
pub fn current_memory_usage(real: bool) -> usize {
    match hooks::with_session(|s| s.underlying_heap()) {
        Ok(Some(heap)) => heap.memory_usage(real),
        _ => native::memory_usage(real),
    }
}

pub fn peak_memory_usage(real: bool) -> usize {
    match hooks::with_session(|s| s.underlying_heap()) {
        Ok(Some(heap)) => heap.peak_memory_usage(real),
        _ => native::peak_memory_usage(real),
    }
}

/// Hook for the host's fatal error path.
///
/// When the active session has `dump_on_limit` set and `kind` is
/// [`FatalErrorKind::MemoryLimit`], the profile is dumped to the output
/// directory and the returned message names the file. The arena's memory
/// limit is lifted while dumping and restored afterwards. In every other case
/// `message` is returned unchanged.
pub fn on_fatal_error(kind: FatalErrorKind, message: &str) -> Cow<'_, str> {
    if kind != FatalErrorKind::MemoryLimit {
        return Cow::Borrowed(message);
    }

    let annotated = hooks::with_session(|session| {
        if !session.flags().dump_on_limit {
            return None;
        }

        let heap = session.underlying_heap();
        let limit = heap.as_ref().map(|heap| {
            let limit = heap.memory_limit();
            heap.set_memory_limit(usize::MAX >> 1);
            limit
        });

        let format = session.output_format();
        let path = session.output_path(format);
        let result = session.dump_to_file(format, &path);

        if let (Some(heap), Some(limit)) = (heap, limit) {
            heap.set_memory_limit(limit);
        }

        Some(match result {
            Ok(()) => format!("{message} (memprof dumped to {})", path.display()),
            Err(err) => {
                warn!(error = %err, "memprof: dump on memory limit failed");
                format!(
                    "{message} (memprof failed dumping to {}, please check file permissions or disk capacity)",
                    path.display()
                )
            }
        })
    });

    match annotated {
        Ok(Some(message)) => Cow::Owned(message),
        _ => Cow::Borrowed(message),
    }
}

/// Crate version, e.g. `"0.3.0"`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
