use crate::output::{
    format_bytes, shorten_function_name, Format, FrameRow, ProfileReport, ReportJson, Reporter,
};
use colored::*;
use prettytable::{color, Attr, Cell, Row, Table};

const HEADERS: [&str; 7] = [
    "Frame",
    "Calls",
    "Self",
    "Self blocks",
    "Inclusive",
    "Inclusive blocks",
    "% Total",
];

pub fn reporter_for(format: Format) -> Box<dyn Reporter> {
    match format {
        Format::Table => Box::new(TableReporter),
        Format::Json => Box::new(JsonReporter),
        Format::JsonPretty => Box::new(JsonPrettyReporter),
    }
}

fn frame_label(row: &FrameRow) -> String {
    let depth = row.path.len().saturating_sub(1);
    format!(
        "{}{}",
        "  ".repeat(depth),
        shorten_function_name(row.function_name())
    )
}

pub(crate) fn display_table(report: &ProfileReport<'_>) {
    let use_colors = std::env::var("NO_COLOR").is_err();

    let mut table = Table::new();

    let header_cells: Vec<Cell> = HEADERS
        .iter()
        .map(|header| {
            if use_colors {
                Cell::new(header)
                    .with_style(Attr::Bold)
                    .with_style(Attr::ForegroundColor(color::CYAN))
            } else {
                Cell::new(header).with_style(Attr::Bold)
            }
        })
        .collect();

    table.add_row(Row::new(header_cells));

    for row in report.rows() {
        table.add_row(Row::new(vec![
            Cell::new(&frame_label(&row)),
            Cell::new(&row.calls.to_string()),
            Cell::new(&format_bytes(row.memory_size as u64)),
            Cell::new(&row.blocks_count.to_string()),
            Cell::new(&format_bytes(row.memory_size_inclusive as u64)),
            Cell::new(&row.blocks_count_inclusive.to_string()),
            Cell::new(&format!("{:.2}%", row.percent_total as f64 / 100.0)),
        ]));
    }

    println!(
        "{} live allocations - frames by inclusive memory still allocated",
        "[memprof]".blue().bold(),
    );

    let (displayed, total) = report.entry_counts();
    if displayed < total {
        println!(
            "{}: {} in {} blocks ({}/{})",
            report.caller_name().yellow().bold(),
            format_bytes(report.total_memory_size() as u64),
            report.total_blocks_count(),
            displayed,
            total
        );
    } else {
        println!(
            "{}: {} in {} blocks",
            report.caller_name().yellow().bold(),
            format_bytes(report.total_memory_size() as u64),
            report.total_blocks_count(),
        );
    }

    table.printstd();
}

fn display_no_frames_message(report: &ProfileReport<'_>) {
    println!(
        "\n{} No frames recorded from {} ({} live in {} blocks)",
        "[memprof]".blue().bold(),
        report.caller_name().yellow().bold(),
        format_bytes(report.total_memory_size() as u64),
        report.total_blocks_count(),
    );
    println!();
    println!(
        "To attribute allocations to functions, add the {} macro:",
        "#[memprof::measure]".cyan().bold()
    );
    println!();
    println!(
        "  {}",
        "#[cfg_attr(feature = \"memprof\", memprof::measure)]".cyan()
    );
    println!("  {}", "fn your_function() {".dimmed());
    println!("  {}", "    // your code here".dimmed());
    println!("  {}", "}".dimmed());
    println!();
    println!(
        "Or use {} for code blocks.",
        "memprof::measure_block!".cyan().bold()
    );
    println!();
}

pub(crate) struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, report: &ProfileReport<'_>) -> Result<(), Box<dyn std::error::Error>> {
        if report.tree().called_functions.is_empty() {
            display_no_frames_message(report);
            return Ok(());
        }

        display_table(report);
        Ok(())
    }
}

pub(crate) struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, report: &ProfileReport<'_>) -> Result<(), Box<dyn std::error::Error>> {
        let json = ReportJson::from(report);
        println!("{}", serde_json::to_string(&json)?);
        Ok(())
    }
}

pub(crate) struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, report: &ProfileReport<'_>) -> Result<(), Box<dyn std::error::Error>> {
        let json = ReportJson::from(report);
        println!("{}", serde_json::to_string_pretty(&json)?);
        Ok(())
    }
}
