//! Serializers for the frame tree.
//!
//! All of them walk children in name order, so two dumps of the same tree are
//! byte-identical.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::frame::Frame;

pub(crate) mod callgraph;
pub(crate) mod samples;
pub(crate) mod tree;

pub use tree::FrameReport;

/// Output formats a session can be dumped in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    /// Callgrind text format, readable by KCachegrind and qcachegrind.
    #[default]
    Callgraph,
    /// pprof legacy heap format with a symbol section.
    Samples,
    /// The nested tree as JSON.
    Tree,
}

impl DumpFormat {
    /// Tag used in generated file names.
    pub fn file_tag(self) -> &'static str {
        match self {
            DumpFormat::Callgraph => "callgrind",
            DumpFormat::Samples => "pprof",
            DumpFormat::Tree => "json",
        }
    }
}

impl fmt::Display for DumpFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DumpFormat::Callgraph => "callgraph",
            DumpFormat::Samples => "samples",
            DumpFormat::Tree => "tree",
        })
    }
}

impl FromStr for DumpFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "callgraph" | "callgrind" => Ok(DumpFormat::Callgraph),
            "samples" | "pprof" => Ok(DumpFormat::Samples),
            "tree" | "json" => Ok(DumpFormat::Tree),
            _ => Err(format!(
                "Unknown dump format '{}'. Valid options: callgraph, samples, tree",
                s
            )),
        }
    }
}

pub(crate) fn write(format: DumpFormat, root: &Frame, out: &mut dyn Write) -> io::Result<()> {
    match format {
        DumpFormat::Callgraph => callgraph::write(root, out),
        DumpFormat::Samples => samples::write(root, &binary_name(), out),
        DumpFormat::Tree => {
            serde_json::to_writer(&mut *out, &FrameReport::from_frame(root))?;
            writeln!(out)
        }
    }
}

/// `<dir>/memprof.<tag>.<ts>`, with `ts` packing seconds and microseconds.
pub(crate) fn generate_filename(dir: &Path, format: DumpFormat, now: SystemTime) -> PathBuf {
    let since_epoch = now.duration_since(UNIX_EPOCH).unwrap_or_default();
    let ts = since_epoch.as_secs() * 0x100000 + u64::from(since_epoch.subsec_micros() % 0x100000);
    dir.join(format!("memprof.{}.{}", format.file_tag(), ts))
}

fn binary_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}
