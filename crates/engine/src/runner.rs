//! Suite runner: resolution, planning and scheduling of one suite

use kwrun_common::{Result, RunConfig, SqliteQuery, SuiteSpec, TemplateLibrary};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::assertion::AssertionEngine;
use crate::executor::{BackendRegistry, Executor};
use crate::extract::Extractor;
use crate::http::HttpBackend;
use crate::plan::{plan, Plan, PlanFilter};
use crate::playwright::PlaywrightBackend;
use crate::scheduler::{CaseResult, RunReport, Scheduler};
use crate::template;
use crate::vars::VariableStore;

/// Runs suites end to end with one configuration and one set of backends
pub struct SuiteRunner {
    config: RunConfig,
    library: TemplateLibrary,
    registry: BackendRegistry,
    assertions: AssertionEngine,
    extractor: Extractor,
    cancel: CancellationToken,
    results_tx: Option<UnboundedSender<CaseResult>>,
}

impl SuiteRunner {
    pub fn new(config: RunConfig, registry: BackendRegistry) -> Self {
        Self {
            config,
            library: TemplateLibrary::default(),
            registry,
            assertions: AssertionEngine::new(),
            extractor: Extractor::new(),
            cancel: CancellationToken::new(),
            results_tx: None,
        }
    }

    /// Build the HTTP and browser backends and the optional database from
    /// the configuration
    pub fn from_config(config: RunConfig) -> Result<Self> {
        config.validate()?;

        let registry = BackendRegistry::new()
            .with(Arc::new(HttpBackend::new(&config.http)?))
            .with(Arc::new(PlaywrightBackend::new(&config.browser)?));

        let mut assertions = AssertionEngine::new();
        let mut extractor = Extractor::new();
        if let Some(db) = &config.database {
            info!("Using database {}", db.path.display());
            let db = Arc::new(SqliteQuery::open(&db.path)?);
            assertions = assertions.with_database(db.clone());
            extractor = extractor.with_database(db);
        }

        Ok(Self {
            assertions,
            extractor,
            ..Self::new(config, registry)
        })
    }

    /// Shared templates and datasets; suite-local definitions win
    pub fn with_library(mut self, library: TemplateLibrary) -> Self {
        self.library = library;
        self
    }

    pub fn with_assertions(mut self, assertions: AssertionEngine) -> Self {
        self.assertions = assertions;
        self
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_results(mut self, tx: UnboundedSender<CaseResult>) -> Self {
        self.results_tx = Some(tx);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Resolve templates and order the selected cases
    ///
    /// Any error here is suite-fatal: nothing of the suite executes.
    pub fn prepare(&self, suite: &SuiteSpec) -> Result<Plan> {
        let cases = template::resolve(suite, &self.library)?;
        plan(cases, suite.module(), &PlanFilter::from_config(&self.config))
    }

    /// Resolve, plan and execute one suite with a fresh variable store
    pub async fn run_suite(&self, suite: &SuiteSpec) -> Result<RunReport> {
        let title = suite.test_info.title.as_str();
        let plan = self.prepare(suite).map_err(|e| {
            error!("Suite '{}' not run: {}", title, e);
            e
        })?;

        // config variables first so suite variables override them
        let store = VariableStore::seeded([&self.config.variables, &suite.test_info.variables]);

        let executor = Executor::new(self.registry.clone(), &self.config);
        let mut scheduler = Scheduler::new(
            &self.config,
            executor,
            self.assertions.clone(),
            self.extractor.clone(),
        )
        .with_cancellation(self.cancel.clone());
        if let Some(tx) = &self.results_tx {
            scheduler = scheduler.with_results(tx.clone());
        }

        scheduler.run(title, &plan, &store).await
    }
}
