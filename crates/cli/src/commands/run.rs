//! `kwrun run`: execute suites and report verdicts

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use kwrun_common::{DatabaseConfig, RunConfig};
use kwrun_engine::{RunReport, SuiteRunner};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::plan::{self, PlanArgs};
use super::SuiteArgs;
use crate::output::{print_error, print_report, print_totals, OutputFormat};

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub suite: SuiteArgs,

    /// Run independent cases concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Worker count when running in parallel
    #[arg(long)]
    pub workers: Option<usize>,

    /// Extra attempts after a transport error
    #[arg(long)]
    pub retry: Option<u32>,

    /// Per-case timeout covering every attempt
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Base URL for relative request and navigation URLs
    #[arg(long)]
    pub base_url: Option<String>,

    /// SQLite database for db_query assertions and extractions
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Stop scheduling after the first failing case
    #[arg(long)]
    pub fail_fast: bool,

    /// Resolve and plan only
    #[arg(long)]
    pub dry_run: bool,

    /// Directory for JSON run reports
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    /// Command-line flags win over the configuration file
    fn apply(&self, config: &mut RunConfig) {
        if self.parallel {
            config.parallel = true;
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(retry) = self.retry {
            config.retry_times = retry;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(base_url) = &self.base_url {
            config.http.base_url = Some(base_url.clone());
            config.browser.base_url = base_url.clone();
        }
        if let Some(path) = &self.db {
            config.database = Some(DatabaseConfig { path: path.clone() });
        }
        if self.fail_fast {
            config.fail_fast = true;
        }
    }
}

/// Returns the process exit code
pub async fn execute(args: RunArgs, format: OutputFormat) -> Result<i32> {
    if args.dry_run {
        return plan::execute(PlanArgs { suite: args.suite }, format).await;
    }

    let mut config = args.suite.load_config()?;
    args.apply(&mut config);
    config.validate()?;

    let library = args.suite.load_library()?;
    let suites = args.suite.load_suites()?;

    let runner = SuiteRunner::from_config(config)?.with_library(library);

    let cancel = runner.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; letting in-flight cases finish");
            cancel.cancel();
        }
    });

    let mut reports: Vec<RunReport> = Vec::new();
    let mut errors = 0;
    for suite in &suites {
        if runner.cancellation_token().is_cancelled() {
            break;
        }
        info!("Suite: {}", suite.test_info.title);
        match runner.run_suite(suite).await {
            Ok(report) => {
                print_report(&report, format);
                if let Some(dir) = &args.output {
                    persist(&report, dir);
                }
                reports.push(report);
            }
            Err(e) => {
                print_error(&format!("{}: {}", suite.test_info.title, e));
                errors += 1;
            }
        }
    }

    print_totals(&reports, errors, format);

    let code = if errors > 0 {
        2
    } else if reports.iter().all(RunReport::is_success) {
        0
    } else {
        1
    };
    if let Some(line) = closing_line(code, format) {
        println!("{}", line);
    }
    Ok(code)
}

/// Write one report; a failure is reported and the remaining suites still run
fn persist(report: &RunReport, dir: &Path) -> bool {
    match report.write_results(dir) {
        Ok(_) => true,
        Err(e) => {
            print_error(&format!("{}: results not written: {}", report.suite_name, e));
            false
        }
    }
}

/// Trailing human-readable line; JSON output stays machine-readable
fn closing_line(code: i32, format: OutputFormat) -> Option<String> {
    match format {
        OutputFormat::Table if code == 0 => Some("All suites passed".green().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Harness {
        #[command(flatten)]
        run: RunArgs,
    }

    #[test]
    fn test_flags_override_config() {
        let harness = Harness::parse_from([
            "kwrun",
            "suites/",
            "--parallel",
            "--workers",
            "8",
            "--retry",
            "2",
            "--base-url",
            "http://localhost:9000",
            "--db",
            "app.db",
            "--tag",
            "smoke",
        ]);
        let mut config = RunConfig::default();
        harness.run.apply(&mut config);

        assert!(config.parallel);
        assert_eq!(config.worker_count(), 8);
        assert_eq!(config.retry_times, 2);
        assert_eq!(config.http.base_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.browser.base_url, "http://localhost:9000");
        assert_eq!(config.database.unwrap().path, PathBuf::from("app.db"));
        assert_eq!(harness.run.suite.tags, vec!["smoke".to_string()]);
        assert!(!config.fail_fast);
    }

    #[test]
    fn test_closing_line_only_in_table_output() {
        assert!(closing_line(0, OutputFormat::Table).is_some());
        assert!(closing_line(1, OutputFormat::Table).is_none());
        assert!(closing_line(0, OutputFormat::Json).is_none());
    }

    #[tokio::test]
    async fn test_unwritable_output_is_not_fatal() {
        let suite = kwrun_common::SuiteSpec::from_yaml("test_info: { title: empty }\n").unwrap();
        let report = SuiteRunner::new(RunConfig::default(), kwrun_engine::BackendRegistry::new())
            .run_suite(&suite)
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("taken");
        std::fs::write(&blocker, "not a directory").unwrap();
        assert!(!persist(&report, &blocker));

        let out = dir.path().join("reports");
        assert!(persist(&report, &out));
        assert!(out.join("empty-results.json").exists());
    }
}
