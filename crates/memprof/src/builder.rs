use std::path::Path;

use colored::*;

use crate::arena::HeapSlot;
use crate::config::Config;
use crate::dump::DumpFormat;
use crate::error::MemprofError;
use crate::guard::FrameGuard;
use crate::hooks;
use crate::output::{Format, ProfileReport, Reporter};
use crate::report::{self, JsonReporter};

/// Builder for a profiling session tied to a guard's lifetime.
///
/// When the [`MemprofGuard`] is dropped it optionally dumps the profile to a
/// file, prints a report of the frames still holding memory and disables the
/// session.
///
/// ```rust,no_run
/// use memprof::{DumpFormat, Format, MemprofBuilder};
///
/// let _memprof = MemprofBuilder::new("main")
///     .native(true)
///     .format(Format::JsonPretty)
///     .dump_on_drop(DumpFormat::Callgraph)
///     .build();
/// ```
///
/// Only one session can be active at a time. [`build`](Self::build) panics if
/// another one is running; use [`try_build`](Self::try_build) to get an error
/// instead.
pub struct MemprofBuilder {
    caller_name: &'static str,
    config: Config,
    reporter: ReporterConfig,
    limit: usize,
    dump_on_drop: Option<DumpFormat>,
}

enum ReporterConfig {
    Format(Format),
    Custom(Box<dyn Reporter>),
    None, // Will default to Format::Table
}

impl MemprofBuilder {
    /// `caller_name` names the outermost frame and the report.
    pub fn new(caller_name: &'static str) -> Self {
        Self {
            caller_name,
            config: Config::new(),
            reporter: ReporterConfig::None,
            limit: 15,
            dump_on_drop: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn native(mut self, native: bool) -> Self {
        self.config = self.config.native(native);
        self
    }

    pub fn dump_on_limit(mut self, dump_on_limit: bool) -> Self {
        self.config = self.config.dump_on_limit(dump_on_limit);
        self
    }

    pub fn output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.config = self.config.output_dir(dir);
        self
    }

    pub fn output_format(mut self, format: DumpFormat) -> Self {
        self.config = self.config.output_format(format);
        self
    }

    pub fn arena(mut self, slot: &'static HeapSlot) -> Self {
        self.config = self.config.arena(slot);
        self
    }

    /// Maximum number of frames in the report, 0 for all. Default: `15`.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.reporter = ReporterConfig::Format(format);
        self
    }

    /// Overrides any format setting.
    pub fn reporter(mut self, reporter: Box<dyn Reporter>) -> Self {
        self.reporter = ReporterConfig::Custom(reporter);
        self
    }

    /// Writes the profile to the output directory before the report.
    pub fn dump_on_drop(mut self, format: DumpFormat) -> Self {
        self.dump_on_drop = Some(format);
        self
    }

    /// # Panics
    ///
    /// Panics if a session is already active.
    pub fn build(self) -> MemprofGuard {
        match self.try_build() {
            Ok(guard) => guard,
            Err(e) => panic!("More than one memprof session cannot be active at the same time: {e}"),
        }
    }

    pub fn try_build(self) -> Result<MemprofGuard, MemprofError> {
        let reporter: Box<dyn Reporter> = match self.reporter {
            ReporterConfig::Format(format) => report::reporter_for(format),
            ReporterConfig::Custom(reporter) => reporter,
            ReporterConfig::None => report::reporter_for(Format::Table),
        };

        // MEMPROF_JSON forces the compact JSON reporter
        let reporter: Box<dyn Reporter> = if std::env::var("MEMPROF_JSON")
            .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
            .unwrap_or(false)
        {
            Box::new(JsonReporter)
        } else {
            reporter
        };

        crate::enable(self.config)?;

        Ok(MemprofGuard {
            caller_name: self.caller_name,
            reporter,
            limit: self.limit,
            dump_on_drop: self.dump_on_drop,
            wrapper: Some(FrameGuard::enter(self.caller_name)),
        })
    }
}

/// An active session started by [`MemprofBuilder`]. Reports and disables on
/// drop.
pub struct MemprofGuard {
    caller_name: &'static str,
    reporter: Box<dyn Reporter>,
    limit: usize,
    dump_on_drop: Option<DumpFormat>,
    wrapper: Option<FrameGuard>,
}

impl Drop for MemprofGuard {
    fn drop(&mut self) {
        drop(self.wrapper.take());

        hooks::suspended(|| {
            if let Some(format) = self.dump_on_drop {
                match crate::dump_to_file(format) {
                    Ok(path) => eprintln!(
                        "{} {} profile written to {}",
                        "[memprof]".blue().bold(),
                        format,
                        path.display()
                    ),
                    Err(e) => eprintln!("Failed to dump memprof profile: {}", e),
                }
            }

            match crate::dump_tree() {
                Ok(tree) => {
                    let report = ProfileReport::new(self.caller_name, &tree, self.limit);
                    if let Err(e) = self.reporter.report(&report) {
                        eprintln!("Failed to report memprof data: {}", e);
                    }
                }
                Err(e) => eprintln!("Failed to report memprof data: {}", e),
            }

            if let Err(e) = crate::disable() {
                eprintln!("Failed to disable memprof: {}", e);
            }
        });
    }
}
