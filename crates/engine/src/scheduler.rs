//! Case scheduling
//!
//! Runs a [`Plan`] on a bounded pool of tokio tasks. A case starts once all
//! of its prerequisites have finished; if any of them did not pass, the case
//! is BLOCKED without touching a backend. Cancellation, the suite timeout
//! and `fail_fast` stop new cases from starting while in-flight ones finish.

use chrono::{DateTime, Utc};
use kwrun_common::{Case, Error, Result, RunConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::assertion::{AssertionEngine, AssertionResult};
use crate::condition;
use crate::executor::Executor;
use crate::extract::{ExtractedVars, Extractor};
use crate::plan::Plan;
use crate::vars::VariableStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Passed,
    Failed,
    Skipped,
    Blocked,
    Timeout,
}

impl Verdict {
    /// Verdicts that stop a fail-fast run; a skipped case is not a failure
    pub fn is_failure(self) -> bool {
        matches!(self, Verdict::Failed | Verdict::Blocked | Verdict::Timeout)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Passed => "PASSED",
            Verdict::Failed => "FAILED",
            Verdict::Skipped => "SKIPPED",
            Verdict::Blocked => "BLOCKED",
            Verdict::Timeout => "TIMEOUT",
        };
        f.write_str(s)
    }
}

/// One record of the result stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub case_name: String,
    pub suite_name: String,
    pub verdict: Verdict,
    pub assertion_results: Vec<AssertionResult>,
    pub extracted_vars: ExtractedVars,
    pub elapsed_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl CaseResult {
    fn new(case: &Case, suite_name: &str, verdict: Verdict) -> Self {
        Self {
            case_name: case.name.clone(),
            suite_name: suite_name.to_string(),
            verdict,
            assertion_results: Vec::new(),
            extracted_vars: ExtractedVars::default(),
            elapsed_ms: 0,
            attempts: 0,
            error: None,
            blocked_by: None,
            raw: None,
        }
    }

    fn blocked(case: &Case, suite_name: &str, prerequisite: &Case, verdict: Verdict) -> Self {
        let mut result = Self::new(case, suite_name, Verdict::Blocked);
        result.blocked_by = Some(prerequisite.name.clone());
        result.error = Some(format!(
            "prerequisite '{}' finished {}",
            prerequisite.name, verdict
        ));
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Complete,
    Partial,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub timeout: usize,
    pub not_run: usize,
}

impl Summary {
    fn tally(results: &[CaseResult], not_run: usize) -> Self {
        let mut summary = Summary {
            total: results.len() + not_run,
            not_run,
            ..Default::default()
        };
        for result in results {
            match result.verdict {
                Verdict::Passed => summary.passed += 1,
                Verdict::Failed => summary.failed += 1,
                Verdict::Skipped => summary.skipped += 1,
                Verdict::Blocked => summary.blocked += 1,
                Verdict::Timeout => summary.timeout += 1,
            }
        }
        summary
    }
}

/// Final record of one suite run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub suite_name: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,

    /// In plan order
    pub results: Vec<CaseResult>,

    /// Cases never scheduled because the run stopped early
    pub not_run: Vec<String>,

    pub summary: Summary,
}

impl RunReport {
    /// Complete run with nothing failed, blocked or timed out
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Complete
            && self.summary.failed + self.summary.blocked + self.summary.timeout == 0
    }

    pub fn result(&self, case_name: &str) -> Option<&CaseResult> {
        self.results.iter().find(|r| r.case_name == case_name)
    }

    /// Write the report as pretty JSON into `dir`
    pub fn write_results(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;

        let stem: String = self
            .suite_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let path = dir.join(format!("{}-results.json", stem));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Runs one case from condition check to extraction
#[derive(Clone)]
struct CaseRunner {
    executor: Executor,
    assertions: AssertionEngine,
    extractor: Extractor,
    extract_on_failure: bool,
}

impl CaseRunner {
    async fn run(&self, suite_name: &str, case: &Case, store: &VariableStore) -> CaseResult {
        let start = Instant::now();
        let mut result = CaseResult::new(case, suite_name, Verdict::Passed);
        let snapshot = store.snapshot();

        if let Some(expression) = case.condition.as_deref() {
            match condition::evaluate(expression, &snapshot) {
                Ok(true) => {}
                Ok(false) => {
                    debug!("Condition '{}' is false, skipping '{}'", expression, case.name);
                    result.verdict = Verdict::Skipped;
                    return result;
                }
                Err(e) => {
                    result.verdict = Verdict::Failed;
                    result.error = Some(e.to_string());
                    return result;
                }
            }
        }

        if let Some(reason) = &case.unresolved {
            result.verdict = Verdict::Failed;
            result.error = Some(format!("case could not be resolved: {}", reason));
            return result;
        }

        let execution = self.executor.execute(case, &snapshot).await;
        result.attempts = execution.attempts;

        match execution.result {
            Ok(outcome) => {
                result.assertion_results = self.assertions.evaluate(&outcome, &execution.assertions);
                let failed = result.assertion_results.iter().filter(|r| !r.passed).count();
                if failed > 0 {
                    result.verdict = Verdict::Failed;
                    result.error = Some(format!(
                        "{} of {} assertion(s) failed",
                        failed,
                        result.assertion_results.len()
                    ));
                }

                if failed == 0 || self.extract_on_failure {
                    match self.extractor.extract(&outcome, &execution.extract, store) {
                        Ok(extracted) => result.extracted_vars = extracted,
                        Err(e) => {
                            result.verdict = Verdict::Failed;
                            result.error = Some(format!("extraction failed: {}", e));
                        }
                    }
                }

                if !outcome.raw.is_null() {
                    result.raw = Some(outcome.raw);
                }
            }
            Err(e @ Error::Timeout { .. }) => {
                result.verdict = Verdict::Timeout;
                result.error = Some(e.to_string());
            }
            Err(e) => {
                result.verdict = Verdict::Failed;
                result.error = Some(e.to_string());
            }
        }

        result.elapsed_ms = start.elapsed().as_millis() as u64;
        result
    }
}

/// Bookkeeping for one run
struct RunState {
    results: Vec<Option<CaseResult>>,
    /// Unfinished prerequisites per case
    pending: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    ready: BinaryHeap<Reverse<usize>>,
}

impl RunState {
    fn new(plan: &Plan) -> Self {
        let pending: Vec<usize> = plan.deps.iter().map(Vec::len).collect();
        let ready = pending
            .iter()
            .enumerate()
            .filter(|(_, &count)| count == 0)
            .map(|(idx, _)| Reverse(idx))
            .collect();
        Self {
            results: (0..plan.len()).map(|_| None).collect(),
            pending,
            dependents: plan.dependents(),
            ready,
        }
    }

    /// First prerequisite of `idx` that did not pass
    fn blocker(&self, plan: &Plan, idx: usize) -> Option<(usize, Verdict)> {
        plan.deps[idx].iter().find_map(|&dep| {
            self.results[dep]
                .as_ref()
                .filter(|r| r.verdict != Verdict::Passed)
                .map(|r| (dep, r.verdict))
        })
    }

    fn record(&mut self, idx: usize, result: CaseResult) {
        self.results[idx] = Some(result);
        for &dependent in &self.dependents[idx] {
            self.pending[dependent] -= 1;
            if self.pending[dependent] == 0 {
                self.ready.push(Reverse(dependent));
            }
        }
    }
}

/// Why a run stopped scheduling new cases
#[derive(Debug, Clone, Copy)]
enum Halt {
    Cancelled,
    SuiteTimeout,
    FailFast,
}

/// Drives a plan through the executor, assertion and extraction engines
pub struct Scheduler {
    runner: Arc<CaseRunner>,
    workers: usize,
    fail_fast: bool,
    suite_timeout: Option<Duration>,
    cancel: CancellationToken,
    results_tx: Option<UnboundedSender<CaseResult>>,
}

impl Scheduler {
    pub fn new(
        config: &RunConfig,
        executor: Executor,
        assertions: AssertionEngine,
        extractor: Extractor,
    ) -> Self {
        Self {
            runner: Arc::new(CaseRunner {
                executor,
                assertions,
                extractor,
                extract_on_failure: config.extract_on_failure,
            }),
            workers: config.worker_count(),
            fail_fast: config.fail_fast,
            suite_timeout: config.suite_timeout(),
            cancel: CancellationToken::new(),
            results_tx: None,
        }
    }

    /// Stream every result, in completion order, to `tx`
    pub fn with_results(mut self, tx: UnboundedSender<CaseResult>) -> Self {
        self.results_tx = Some(tx);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every case of `plan` against `store`
    pub async fn run(&self, suite_name: &str, plan: &Plan, store: &VariableStore) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = self
            .suite_timeout
            .map(|limit| tokio::time::Instant::now() + limit);

        info!(
            "Running {} case(s) from '{}' with {} worker(s)",
            plan.len(),
            suite_name,
            self.workers
        );

        let mut state = RunState::new(plan);
        let mut tasks: JoinSet<(usize, CaseResult)> = JoinSet::new();
        let mut halt: Option<Halt> = None;

        loop {
            if halt.is_none() && self.cancel.is_cancelled() {
                halt = Some(Halt::Cancelled);
            }

            // Blocked cases are settled even after a halt; nothing new starts.
            loop {
                if halt.is_none() && tasks.len() >= self.workers {
                    break;
                }
                let Some(Reverse(idx)) = state.ready.pop() else {
                    break;
                };
                let case = &plan.cases[idx];

                if let Some((dep, verdict)) = state.blocker(plan, idx) {
                    let result = CaseResult::blocked(case, suite_name, &plan.cases[dep], verdict);
                    self.finish(&mut state, idx, result, &mut halt);
                    continue;
                }
                if halt.is_some() {
                    continue;
                }

                let runner = Arc::clone(&self.runner);
                let case = case.clone();
                let store = store.clone();
                let suite = suite_name.to_string();
                debug!("Scheduling '{}'", case.name);
                tasks.spawn(async move { (idx, runner.run(&suite, &case, &store).await) });
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = self.cancel.cancelled(), if halt.is_none() => {
                    warn!("Run cancelled; waiting for {} in-flight case(s)", tasks.len());
                    halt = Some(Halt::Cancelled);
                }
                _ = expire(deadline), if halt.is_none() && deadline.is_some() => {
                    warn!("Suite timeout reached; waiting for {} in-flight case(s)", tasks.len());
                    halt = Some(Halt::SuiteTimeout);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((idx, result))) => self.finish(&mut state, idx, result, &mut halt),
                    Some(Err(e)) => {
                        error!("Case task aborted: {}", e);
                        tasks.abort_all();
                        return Err(Error::Backend(format!("case task aborted: {}", e)));
                    }
                    None => break,
                },
            }
        }

        let not_run: Vec<String> = state
            .results
            .iter()
            .zip(&plan.cases)
            .filter(|(result, _)| result.is_none())
            .map(|(_, case)| case.name.clone())
            .collect();
        let results: Vec<CaseResult> = state.results.into_iter().flatten().collect();
        let summary = Summary::tally(&results, not_run.len());
        let status = if not_run.is_empty() {
            RunStatus::Complete
        } else {
            RunStatus::Partial
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        if let Some(reason) = halt {
            warn!(
                "Run of '{}' stopped early ({:?}); {} case(s) not run",
                suite_name,
                reason,
                not_run.len()
            );
        }
        info!(
            "Results: {} passed, {} failed, {} skipped, {} blocked, {} timed out ({} ms)",
            summary.passed,
            summary.failed,
            summary.skipped,
            summary.blocked,
            summary.timeout,
            duration_ms
        );

        Ok(RunReport {
            run_id,
            suite_name: suite_name.to_string(),
            status,
            started_at,
            duration_ms,
            results,
            not_run,
            summary,
        })
    }

    fn finish(&self, state: &mut RunState, idx: usize, result: CaseResult, halt: &mut Option<Halt>) {
        match result.verdict {
            Verdict::Passed => info!("✓ {} ({} ms)", result.case_name, result.elapsed_ms),
            Verdict::Skipped => info!("○ {} (skipped)", result.case_name),
            Verdict::Blocked => warn!(
                "⊘ {} - blocked by '{}'",
                result.case_name,
                result.blocked_by.as_deref().unwrap_or_default()
            ),
            Verdict::Failed | Verdict::Timeout => error!(
                "✗ {} - {}",
                result.case_name,
                result.error.as_deref().unwrap_or("unknown error")
            ),
        }

        if self.fail_fast && halt.is_none() && result.verdict.is_failure() {
            *halt = Some(Halt::FailFast);
        }
        if let Some(tx) = &self.results_tx {
            // a dropped receiver only means nobody is listening
            let _ = tx.send(result.clone());
        }
        state.record(idx, result);
    }
}

async fn expire(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ExecutionOutcome, Payload};
    use crate::executor::BackendRegistry;
    use crate::plan::{plan, PlanFilter};
    use kwrun_common::{Action, Capability, Request};
    use serde_json::json;

    /// Answers every request with the status code named in its URL
    struct StatusBackend;

    #[async_trait::async_trait]
    impl Backend for StatusBackend {
        fn capability(&self) -> Capability {
            Capability::Request
        }

        async fn execute(&self, payload: &Payload) -> Result<ExecutionOutcome> {
            let Action::Request(req) = &payload.action else {
                return Err(Error::Backend("not a request".into()));
            };
            let status = req.url.trim_start_matches('/').parse().unwrap_or(200);
            Ok(ExecutionOutcome {
                status: Some(status),
                body: json!({"token": format!("tok-{}", status)}),
                ..Default::default()
            })
        }
    }

    fn case(name: &str, url: &str, deps: &[&str]) -> Case {
        Case {
            name: name.into(),
            description: String::new(),
            tags: Default::default(),
            condition: None,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            action: Action::Request(Request {
                method: "GET".into(),
                url: url.into(),
                headers: Default::default(),
                params: Default::default(),
                json: None,
                data: None,
                body: None,
                timeout_ms: None,
            }),
            assertions: vec![serde_json::from_value(
                json!({"type": "status_code", "expected": 200}),
            )
            .unwrap()],
            extract: vec![],
            unresolved: None,
        }
    }

    fn scheduler(config: &RunConfig) -> Scheduler {
        let registry = BackendRegistry::new().with(Arc::new(StatusBackend));
        Scheduler::new(
            config,
            Executor::new(registry, config),
            AssertionEngine::new(),
            Extractor::new(),
        )
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents() {
        let cases = vec![
            case("login", "/500", &[]),
            case("profile", "/200", &["login"]),
            case("orders", "/200", &["profile"]),
            case("health", "/200", &[]),
        ];
        let plan = plan(cases, None, &PlanFilter::default()).unwrap();
        let config = RunConfig::default();
        let report = scheduler(&config)
            .run("shop", &plan, &VariableStore::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Complete);
        assert_eq!(report.result("login").unwrap().verdict, Verdict::Failed);
        let profile = report.result("profile").unwrap();
        assert_eq!(profile.verdict, Verdict::Blocked);
        assert_eq!(profile.blocked_by.as_deref(), Some("login"));
        assert_eq!(profile.attempts, 0);
        assert_eq!(
            report.result("orders").unwrap().blocked_by.as_deref(),
            Some("profile")
        );
        assert_eq!(report.result("health").unwrap().verdict, Verdict::Passed);
        assert_eq!(
            report.summary,
            Summary {
                total: 4,
                passed: 1,
                failed: 1,
                skipped: 0,
                blocked: 2,
                timeout: 0,
                not_run: 0,
            }
        );
        assert!(!report.is_success());
    }

    #[tokio::test]
    async fn test_results_in_plan_order_and_streamed() {
        let cases = vec![case("a", "/200", &[]), case("b", "/200", &[]), case("c", "/200", &["a"])];
        let plan = plan(cases, None, &PlanFilter::default()).unwrap();
        let config = RunConfig {
            parallel: true,
            max_workers: 3,
            ..Default::default()
        };
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let report = scheduler(&config)
            .with_results(tx)
            .run("s", &plan, &VariableStore::new())
            .await
            .unwrap();

        let names: Vec<_> = report.results.iter().map(|r| r.case_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(report.is_success());

        let mut streamed = 0;
        while rx.try_recv().is_ok() {
            streamed += 1;
        }
        assert_eq!(streamed, 3);
    }

    #[tokio::test]
    async fn test_write_results() {
        let plan = plan(vec![case("a", "/200", &[])], None, &PlanFilter::default()).unwrap();
        let config = RunConfig::default();
        let report = scheduler(&config)
            .run("smoke suite", &plan, &VariableStore::new())
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = report.write_results(dir.path()).unwrap();
        assert!(path.ends_with("smoke_suite-results.json"));

        let written: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(written["status"], "COMPLETE");
        assert_eq!(written["results"][0]["verdict"], "PASSED");
        assert!(written["results"][0].get("blocked_by").is_none());
    }
}
