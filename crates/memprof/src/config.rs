use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arena::HeapSlot;
use crate::dump::DumpFormat;

/// The boolean switches a session runs with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileFlags {
    /// A session is active.
    pub enabled: bool,
    /// The process allocator is intercepted.
    pub native: bool,
    /// A host memory-limit error triggers an automatic dump.
    pub dump_on_limit: bool,
}

/// Settings for a profiling session, consumed by [`enable`](crate::enable).
///
/// ```rust,no_run
/// use memprof::{Config, DumpFormat};
///
/// let config = Config::new()
///     .native(true)
///     .dump_on_limit(true)
///     .output_dir("/var/tmp")
///     .output_format(DumpFormat::Samples);
/// memprof::enable(config).unwrap();
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) native: bool,
    pub(crate) dump_on_limit: bool,
    pub(crate) output_dir: PathBuf,
    pub(crate) output_format: DumpFormat,
    pub(crate) arena: Option<&'static HeapSlot>,
    pub(crate) passthrough: Vec<Box<str>>,
}

impl Config {
    pub fn new() -> Self {
        Self {
            native: false,
            dump_on_limit: false,
            output_dir: std::env::temp_dir(),
            output_format: DumpFormat::default(),
            arena: None,
            passthrough: Vec::new(),
        }
    }

    /// Intercept the process allocator. Only effective when
    /// [`MemprofAllocator`](crate::MemprofAllocator) is the global allocator.
    pub fn native(mut self, native: bool) -> Self {
        self.native = native;
        self
    }

    pub fn dump_on_limit(mut self, dump_on_limit: bool) -> Self {
        self.dump_on_limit = dump_on_limit;
        self
    }

    /// Directory automatic dumps are written to. Defaults to the system
    /// temporary directory.
    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn output_format(mut self, format: DumpFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Intercept the heap installed in `slot` for the lifetime of the session.
    pub fn arena(mut self, slot: &'static HeapSlot) -> Self {
        self.arena = Some(slot);
        self
    }

    /// Call names that only forward to another call. They never become
    /// frames.
    pub fn passthrough<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.passthrough.extend(names.into_iter().map(|n| n.as_ref().into()));
        self
    }

    pub(crate) fn flags(&self) -> ProfileFlags {
        ProfileFlags {
            enabled: true,
            native: self.native,
            dump_on_limit: self.dump_on_limit,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("native", &self.native)
            .field("dump_on_limit", &self.dump_on_limit)
            .field("output_dir", &self.output_dir)
            .field("output_format", &self.output_format)
            .field("arena", &self.arena.is_some())
            .field("passthrough", &self.passthrough)
            .finish()
    }
}
