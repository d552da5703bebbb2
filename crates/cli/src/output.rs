//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use kwrun_engine::{CaseResult, RunReport, RunStatus, Verdict};
use serde::Serialize;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn new_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            let mut table = new_table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
    }
}

fn verdict_color(verdict: Verdict) -> Color {
    match verdict {
        Verdict::Passed => Color::Green,
        Verdict::Failed | Verdict::Timeout => Color::Red,
        Verdict::Blocked => Color::Yellow,
        Verdict::Skipped => Color::DarkGrey,
    }
}

/// First line worth showing for a case that did not pass
fn detail(result: &CaseResult) -> String {
    if let Some(blocked_by) = &result.blocked_by {
        return format!("blocked by {}", blocked_by);
    }
    let failed: Vec<String> = result
        .assertion_results
        .iter()
        .filter(|a| !a.passed)
        .map(|a| a.message.clone())
        .collect();
    if !failed.is_empty() {
        return failed.join("; ");
    }
    result.error.clone().unwrap_or_default()
}

/// Print one suite's report
pub fn print_report(report: &RunReport, format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let mut table = new_table();
            table.set_header(vec!["Case", "Verdict", "Attempts", "Duration", "Detail"]);
            for result in &report.results {
                table.add_row(vec![
                    Cell::new(&result.case_name),
                    Cell::new(result.verdict.to_string()).fg(verdict_color(result.verdict)),
                    Cell::new(result.attempts),
                    Cell::new(format!("{}ms", result.elapsed_ms)),
                    Cell::new(detail(result)),
                ]);
            }
            for name in &report.not_run {
                table.add_row(vec![
                    Cell::new(name),
                    Cell::new("NOT RUN").fg(Color::DarkGrey),
                    Cell::new(0),
                    Cell::new("-"),
                    Cell::new(""),
                ]);
            }

            println!("{} ({})", report.suite_name.bold(), report.run_id);
            println!("{table}");
            let s = &report.summary;
            let line = format!(
                "{} passed, {} failed, {} skipped, {} blocked, {} timed out, {} not run ({} ms)",
                s.passed, s.failed, s.skipped, s.blocked, s.timeout, s.not_run, report.duration_ms
            );
            if report.is_success() {
                println!("{}", line.green());
            } else {
                println!("{}", line.red());
            }
            if report.status == RunStatus::Partial {
                print_warning("run stopped early; status PARTIAL");
            }
            println!();
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        }
    }
}

/// Print the totals over several suites
pub fn print_totals(reports: &[RunReport], errors: usize, format: OutputFormat) {
    if matches!(format, OutputFormat::Json) || reports.len() + errors < 2 {
        return;
    }
    let passed = reports.iter().filter(|r| r.is_success()).count();
    println!(
        "Suites: {} passed, {} failed, {} not run",
        passed.to_string().green(),
        (reports.len() - passed).to_string().red(),
        errors.to_string().yellow()
    );
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("❌ {}", message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("⚠️  {}", message);
}

/// Print info message
pub fn print_info(message: &str) {
    println!("ℹ️  {}", message);
}
