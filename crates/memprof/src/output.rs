use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::dump::FrameReport;

/// Output format for the report printed when a [`MemprofGuard`](crate::MemprofGuard)
/// is dropped.
///
/// ```rust
/// use memprof::{MemprofBuilder, Format};
///
/// let builder = MemprofBuilder::new("main").format(Format::JsonPretty);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Table,
    Json,
    JsonPretty,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            "json-pretty" => Ok(Format::JsonPretty),
            _ => Err(format!(
                "Unknown format '{}'. Valid options: table, json, json-pretty",
                s
            )),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Table => "table",
            Format::Json => "json",
            Format::JsonPretty => "json-pretty",
        })
    }
}

/// One frame of the tree, identified by its call path from the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRow {
    pub path: Vec<String>,
    pub calls: u64,
    pub memory_size: usize,
    pub blocks_count: usize,
    pub memory_size_inclusive: usize,
    pub blocks_count_inclusive: usize,
    /// Inclusive bytes as basis points of the tree total (1% = 100).
    pub percent_total: u64,
}

impl FrameRow {
    pub fn function_name(&self) -> &str {
        self.path.last().map(String::as_str).unwrap_or("root")
    }
}

/// What a [`Reporter`] gets to see: a tree dump plus the name of the
/// profiled entry point.
pub struct ProfileReport<'a> {
    caller_name: &'a str,
    tree: &'a FrameReport,
    limit: usize,
}

impl<'a> ProfileReport<'a> {
    /// `limit` caps the number of rows; 0 means all.
    pub fn new(caller_name: &'a str, tree: &'a FrameReport, limit: usize) -> Self {
        Self {
            caller_name,
            tree,
            limit,
        }
    }

    pub fn caller_name(&self) -> &str {
        self.caller_name
    }

    pub fn tree(&self) -> &FrameReport {
        self.tree
    }

    pub fn total_memory_size(&self) -> usize {
        self.tree.memory_size_inclusive
    }

    pub fn total_blocks_count(&self) -> usize {
        self.tree.blocks_count_inclusive
    }

    fn all_rows(&self) -> Vec<FrameRow> {
        let total = self.total_memory_size();
        let mut rows = Vec::new();
        self.tree.visit(&mut |path, frame| {
            if frame.memory_size_inclusive == 0 {
                return;
            }
            let percent_total = if total == 0 {
                0
            } else {
                (frame.memory_size_inclusive as u128 * 10_000 / total as u128) as u64
            };
            rows.push(FrameRow {
                path: path.iter().map(|s| s.to_string()).collect(),
                calls: frame.calls,
                memory_size: frame.memory_size,
                blocks_count: frame.blocks_count,
                memory_size_inclusive: frame.memory_size_inclusive,
                blocks_count_inclusive: frame.blocks_count_inclusive,
                percent_total,
            });
        });

        rows.sort_by(|a, b| {
            b.memory_size_inclusive
                .cmp(&a.memory_size_inclusive)
                .then_with(|| a.path.cmp(&b.path))
        });
        rows
    }

    /// Frames still holding memory, sorted by inclusive bytes, largest first,
    /// capped at the limit.
    pub fn rows(&self) -> Vec<FrameRow> {
        let mut rows = self.all_rows();
        if self.limit > 0 {
            rows.truncate(self.limit);
        }
        rows
    }

    /// `(displayed, total)` row counts.
    pub fn entry_counts(&self) -> (usize, usize) {
        let total = self.all_rows().len();
        let displayed = if self.limit > 0 {
            total.min(self.limit)
        } else {
            total
        };
        (displayed, total)
    }
}

/// JSON form of a [`ProfileReport`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportJson {
    pub caller_name: String,
    pub total_memory_size: usize,
    pub total_blocks_count: usize,
    pub frames: Vec<FrameRow>,
}

impl From<&ProfileReport<'_>> for ReportJson {
    fn from(report: &ProfileReport<'_>) -> Self {
        Self {
            caller_name: report.caller_name().to_string(),
            total_memory_size: report.total_memory_size(),
            total_blocks_count: report.total_blocks_count(),
            frames: report.rows(),
        }
    }
}

/// Trait for implementing custom report output.
///
/// ```rust
/// use memprof::{ProfileReport, Reporter};
/// use std::error::Error;
///
/// struct Summary;
///
/// impl Reporter for Summary {
///     fn report(&self, report: &ProfileReport<'_>) -> Result<(), Box<dyn Error>> {
///         println!("{}: {} bytes live", report.caller_name(), report.total_memory_size());
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter: Send + Sync {
    fn report(&self, report: &ProfileReport<'_>) -> Result<(), Box<dyn std::error::Error>>;
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log(THRESHOLD).floor() as usize).min(UNITS.len() - 1);
    let unit_value = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", unit_value, UNITS[unit_index])
    }
}

/// Keeps the last two `::` segments of a path.
pub fn shorten_function_name(function_name: &str) -> String {
    let parts: Vec<&str> = function_name.split("::").collect();
    if parts.len() > 2 {
        parts[parts.len() - 2..].join("::")
    } else {
        function_name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(memory_size: usize, children: Vec<(&str, FrameReport)>) -> FrameReport {
        let mut report = FrameReport {
            memory_size,
            blocks_count: usize::from(memory_size > 0),
            calls: 1,
            ..Default::default()
        };
        report.memory_size_inclusive = memory_size;
        report.blocks_count_inclusive = report.blocks_count;
        for (name, child) in children {
            report.memory_size_inclusive += child.memory_size_inclusive;
            report.blocks_count_inclusive += child.blocks_count_inclusive;
            report.called_functions.insert(name.to_string(), child);
        }
        report
    }

    fn sample_tree() -> FrameReport {
        frame(
            0,
            vec![
                ("app::load", frame(300, vec![("app::parse", frame(600, vec![]))])),
                ("app::idle", frame(100, vec![])),
            ],
        )
    }

    #[test]
    fn test_rows_sorted_by_inclusive_bytes() {
        let tree = sample_tree();
        let report = ProfileReport::new("app::main", &tree, 0);
        let rows = report.rows();

        let names: Vec<_> = rows.iter().map(FrameRow::function_name).collect();
        assert_eq!(names, ["app::load", "app::parse", "app::idle"]);
        assert_eq!(rows[0].memory_size_inclusive, 900);
        assert_eq!(rows[0].percent_total, 9000);
        assert_eq!(rows[1].path, ["app::load", "app::parse"]);
        assert_eq!(report.total_memory_size(), 1000);
    }

    #[test]
    fn test_frames_without_live_memory_are_skipped() {
        let tree = frame(
            0,
            vec![
                ("app::scratch", frame(0, vec![])),
                ("app::load", frame(10, vec![])),
            ],
        );
        let report = ProfileReport::new("app::main", &tree, 0);
        let rows = report.rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].function_name(), "app::load");
        assert_eq!(report.entry_counts(), (1, 1));
    }

    #[test]
    fn test_limit() {
        let tree = sample_tree();
        let report = ProfileReport::new("app::main", &tree, 2);
        assert_eq!(report.rows().len(), 2);
        assert_eq!(report.entry_counts(), (2, 3));
    }

    #[test]
    fn test_report_json() {
        let tree = sample_tree();
        let report = ProfileReport::new("app::main", &tree, 1);
        let json = ReportJson::from(&report);
        assert_eq!(json.caller_name, "app::main");
        assert_eq!(json.total_blocks_count, 3);
        assert_eq!(json.frames.len(), 1);

        let text = serde_json::to_string(&json).unwrap();
        let back: ReportJson = serde_json::from_str(&text).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn test_shorten_function_name() {
        assert_eq!(shorten_function_name("a::b::c"), "b::c");
        assert_eq!(shorten_function_name("b::c"), "b::c");
        assert_eq!(shorten_function_name("root"), "root");
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("json-pretty".parse::<Format>().unwrap(), Format::JsonPretty);
        assert!("yaml".parse::<Format>().is_err());
    }
}
