use std::fs;
use std::path::PathBuf;

use clap::Parser;
use eyre::{Result, WrapErr};
use memprof::{reporter_for, Format, FrameReport, ProfileReport};

#[derive(Debug, Parser)]
pub struct ReportArgs {
    #[arg(help = "Path to a tree dump (memprof.json.<ts>)")]
    pub path: PathBuf,

    #[arg(
        long,
        default_value_t = Format::Table,
        help = "Output format: table, json or json-pretty"
    )]
    pub format: Format,

    #[arg(
        long,
        default_value_t = 15,
        help = "Maximum number of frames to show, 0 for all"
    )]
    pub limit: usize,

    #[arg(long, help = "Name shown as the report header, defaults to the file name")]
    pub caller: Option<String>,
}

impl ReportArgs {
    pub fn run(&self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)
            .wrap_err_with(|| format!("Failed to read {}", self.path.display()))?;
        let tree: FrameReport = serde_json::from_str(&raw)
            .wrap_err_with(|| format!("{} is not a memprof tree dump", self.path.display()))?;

        tracing::debug!(
            path = %self.path.display(),
            frames = tree.called_functions.len(),
            "loaded tree dump"
        );

        let caller = match &self.caller {
            Some(caller) => caller.clone(),
            None => self
                .path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "memprof".to_string()),
        };

        let report = ProfileReport::new(&caller, &tree, self.limit);
        reporter_for(self.format)
            .report(&report)
            .map_err(|e| eyre::eyre!("Failed to render report: {}", e))
    }
}
