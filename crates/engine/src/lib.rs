//! kwrun engine
//!
//! Case resolution and execution pipeline for declarative API and browser
//! test suites:
//! - Expands templates and datasets into concrete cases
//! - Orders cases by `depends_on` and rejects cycles
//! - Threads extracted variables from one case into the next
//! - Runs keywords against pluggable backends with retry and timeout
//! - Evaluates every assertion and reports per-case verdicts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       SuiteRunner                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  template::resolve(suite, library) -> Vec<Case>             │
//! │  plan::plan(cases, module, filter) -> Plan                  │
//! │  Scheduler::run(suite, plan, store) -> RunReport            │
//! │    └── per case (JoinSet, bounded by max_workers)           │
//! │          ├── condition::evaluate(condition, snapshot)       │
//! │          ├── Executor::execute(case, snapshot)              │
//! │          │     ├── ${...} substitution                      │
//! │          │     └── Backend::execute (HTTP | Playwright)     │
//! │          ├── AssertionEngine::evaluate(outcome, assertions) │
//! │          └── Extractor::extract(outcome, rules, store)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod assertion;
pub mod backend;
pub mod condition;
pub mod executor;
pub mod extract;
pub mod http;
pub mod plan;
pub mod playwright;
pub mod runner;
pub mod scheduler;
pub mod select;
pub mod template;
pub mod vars;

pub use assertion::{AssertionEngine, AssertionResult, Operator};
pub use backend::{Backend, ElementSnapshot, ExecutionOutcome, Payload, Probe};
pub use executor::{BackendRegistry, Execution, Executor};
pub use extract::{ExtractedVars, Extractor};
pub use http::HttpBackend;
pub use plan::{Plan, PlanEntry, PlanFilter};
pub use playwright::PlaywrightBackend;
pub use runner::SuiteRunner;
pub use scheduler::{CaseResult, RunReport, RunStatus, Scheduler, Summary, Verdict};
pub use vars::{VariableStore, Vars};
