//! `kwrun plan`: show the resolved execution order without running anything

use anyhow::Result;
use clap::Args;
use kwrun_engine::template::runtime_inputs;
use kwrun_engine::{BackendRegistry, SuiteRunner};
use serde::Serialize;

use super::SuiteArgs;
use crate::output::{print_error, print_info, print_list, OutputFormat, TableDisplay};

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub suite: SuiteArgs,
}

/// One planned case
#[derive(Debug, Serialize)]
pub struct PlanRow {
    pub suite: String,
    pub position: usize,
    pub name: String,
    pub capability: String,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
    /// Variables the case reads at run time
    pub inputs: Vec<String>,
}

impl TableDisplay for PlanRow {
    fn headers() -> Vec<&'static str> {
        vec!["#", "Case", "Kind", "Depends on", "Tags", "Inputs"]
    }

    fn row(&self) -> Vec<String> {
        vec![
            (self.position + 1).to_string(),
            self.name.clone(),
            self.capability.clone(),
            self.depends_on.join(", "),
            self.tags.join(", "),
            self.inputs.join(", "),
        ]
    }
}

/// Returns the process exit code
pub async fn execute(args: PlanArgs, format: OutputFormat) -> Result<i32> {
    let config = args.suite.load_config()?;
    let library = args.suite.load_library()?;
    let suites = args.suite.load_suites()?;

    // planning needs no backends
    let runner = SuiteRunner::new(config, BackendRegistry::new()).with_library(library);

    let mut rows = Vec::new();
    let mut errors = 0;
    for suite in &suites {
        let plan = match runner.prepare(suite) {
            Ok(plan) => plan,
            Err(e) => {
                print_error(&format!("{}: {}", suite.test_info.title, e));
                errors += 1;
                continue;
            }
        };
        if !plan.excluded.is_empty() && matches!(format, OutputFormat::Table) {
            print_info(&format!(
                "{}: {} case(s) excluded by filters",
                suite.test_info.title,
                plan.excluded.len()
            ));
        }
        for (entry, case) in plan.entries().into_iter().zip(&plan.cases) {
            rows.push(PlanRow {
                suite: suite.test_info.title.clone(),
                position: entry.position,
                name: entry.name,
                capability: entry.capability,
                depends_on: entry.depends_on,
                tags: entry.tags,
                inputs: runtime_inputs(case).into_iter().collect(),
            });
        }
    }

    print_list(&rows, format);
    Ok(if errors > 0 { 2 } else { 0 })
}
