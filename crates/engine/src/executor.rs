//! Keyword executor: variable resolution, backend dispatch, retries and timeout

use kwrun_common::{
    Action, Assertion, AssertionKind, Capability, Case, Error, Extraction, ExtractionKind,
    Result, RunConfig,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::{Backend, ExecutionOutcome, Payload, Probe};
use crate::vars::{substitute_value, Vars};

/// Backends keyed by the capability they serve
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<Capability, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, replacing any previous one for the same capability
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.capability(), backend);
    }

    pub fn with(mut self, backend: Arc<dyn Backend>) -> Self {
        self.register(backend);
        self
    }

    pub fn get(&self, capability: Capability) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(&capability)
            .cloned()
            .ok_or_else(|| Error::BackendUnavailable(capability.to_string()))
    }

    pub fn capabilities(&self) -> BTreeSet<Capability> {
        self.backends.keys().copied().collect()
    }
}

/// A case with every `${...}` token resolved against one snapshot
#[derive(Debug, Clone)]
pub struct PreparedCase {
    pub action: Action,
    pub assertions: Vec<Assertion>,
    pub extract: Vec<Extraction>,
}

impl PreparedCase {
    pub fn prepare(case: &Case, vars: &Vars) -> Result<Self> {
        Ok(Self {
            action: resolve(&case.action, vars)?,
            assertions: resolve(&case.assertions, vars)?,
            extract: resolve(&case.extract, vars)?,
        })
    }

    /// DOM elements the browser backend must report on
    pub fn probes(&self) -> Vec<Probe> {
        let mut wanted: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for assertion in &self.assertions {
            if matches!(
                assertion.kind,
                AssertionKind::ElementVisible | AssertionKind::ElementText
            ) {
                if let Some(locator) = assertion.path.as_deref() {
                    wanted.entry(locator).or_default();
                }
            }
        }
        for rule in &self.extract {
            if rule.kind == ExtractionKind::ElementAttribute {
                let attrs = wanted.entry(rule.path.as_str()).or_default();
                if let Some(attr) = rule.attribute.as_deref() {
                    attrs.insert(attr);
                }
            }
        }
        wanted
            .into_iter()
            .map(|(locator, attrs)| Probe {
                locator: locator.to_string(),
                attributes: attrs.into_iter().map(String::from).collect(),
            })
            .collect()
    }
}

/// Substitute tokens in any serializable model value
fn resolve<T: Serialize + DeserializeOwned>(value: &T, vars: &Vars) -> Result<T> {
    let tree = serde_json::to_value(value)?;
    let resolved = substitute_value(&tree, vars, false)?;
    Ok(serde_json::from_value(resolved)?)
}

/// What the executor produced for one case
#[derive(Debug)]
pub struct Execution {
    pub result: Result<ExecutionOutcome>,

    /// Backend calls made, including retries
    pub attempts: u32,

    /// Resolved assertions; empty when resolution itself failed
    pub assertions: Vec<Assertion>,

    /// Resolved extractions; empty when resolution itself failed
    pub extract: Vec<Extraction>,
}

impl Execution {
    fn unresolved(error: Error) -> Self {
        Self {
            result: Err(error),
            attempts: 0,
            assertions: Vec::new(),
            extract: Vec::new(),
        }
    }
}

/// Dispatches cases to backends with retry and timeout
#[derive(Clone)]
pub struct Executor {
    registry: BackendRegistry,
    retry_times: u32,
    retry_backoff: Duration,
    timeout: Duration,
}

impl Executor {
    pub fn new(registry: BackendRegistry, config: &RunConfig) -> Self {
        Self {
            registry,
            retry_times: config.retry_times,
            retry_backoff: config.retry_backoff(),
            timeout: config.timeout(),
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// Resolve and execute one case against the snapshot `vars`
    ///
    /// Only transport errors are retried. The timeout covers every attempt
    /// and the pauses between them.
    pub async fn execute(&self, case: &Case, vars: &Vars) -> Execution {
        let prepared = match PreparedCase::prepare(case, vars) {
            Ok(prepared) => prepared,
            Err(e) => return Execution::unresolved(e),
        };
        let probes = prepared.probes();
        let PreparedCase {
            action,
            assertions,
            extract,
        } = prepared;

        let backend = match self.registry.get(action.capability()) {
            Ok(backend) => backend,
            Err(e) => {
                return Execution {
                    result: Err(e),
                    attempts: 0,
                    assertions,
                    extract,
                }
            }
        };

        let payload = Payload {
            case_name: case.name.clone(),
            action,
            probes,
        };

        let mut attempts = 0;
        let timed = tokio::time::timeout(
            self.timeout,
            self.attempt(backend.as_ref(), &payload, &mut attempts),
        )
        .await;
        let result = match timed {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Case '{}' timed out after {} ms ({} attempt(s))",
                    case.name,
                    self.timeout.as_millis(),
                    attempts
                );
                Err(Error::Timeout {
                    millis: self.timeout.as_millis() as u64,
                })
            }
        };

        Execution {
            result,
            attempts,
            assertions,
            extract,
        }
    }

    async fn attempt(
        &self,
        backend: &dyn Backend,
        payload: &Payload,
        attempts: &mut u32,
    ) -> Result<ExecutionOutcome> {
        loop {
            *attempts += 1;
            debug!(
                "Dispatching '{}' to {} backend (attempt {})",
                payload.case_name,
                backend.capability(),
                attempts
            );
            match backend.execute(payload).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_transport() && *attempts <= self.retry_times => {
                    warn!(
                        "Transport error on '{}' (attempt {}/{}): {}; retrying in {} ms",
                        payload.case_name,
                        attempts,
                        self.retry_times + 1,
                        e,
                        self.retry_backoff.as_millis()
                    );
                    tokio::time::sleep(self.retry_backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwrun_common::{ExtractScope, Request, Step};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait::async_trait]
    impl Backend for Flaky {
        fn capability(&self) -> Capability {
            Capability::Request
        }

        async fn execute(&self, _payload: &Payload) -> Result<ExecutionOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::BackendTransport("connection reset".into()));
            }
            Ok(ExecutionOutcome {
                status: Some(200),
                ..Default::default()
            })
        }
    }

    fn request_case(url: &str) -> Case {
        Case {
            name: "c".into(),
            description: String::new(),
            tags: Default::default(),
            condition: None,
            depends_on: vec![],
            action: Action::Request(Request {
                method: "GET".into(),
                url: url.into(),
                headers: [("Authorization".to_string(), "Bearer ${token}".to_string())]
                    .into_iter()
                    .collect(),
                params: Default::default(),
                json: Some(json!({"id": "${id}"})),
                data: None,
                body: None,
                timeout_ms: None,
            }),
            assertions: vec![],
            extract: vec![],
            unresolved: None,
        }
    }

    fn config(retry_times: u32) -> RunConfig {
        RunConfig {
            retry_times,
            retry_backoff_ms: 1,
            timeout_ms: 5_000,
            ..Default::default()
        }
    }

    fn vars() -> Vars {
        let mut vars = Vars::new();
        vars.insert("token".into(), json!("t"));
        vars.insert("id".into(), json!(7));
        vars
    }

    #[test]
    fn test_prepare_resolves_tokens() {
        let prepared = PreparedCase::prepare(&request_case("/u/${id}"), &vars()).unwrap();
        let Action::Request(req) = prepared.action else {
            panic!("expected request");
        };
        assert_eq!(req.url, "/u/7");
        assert_eq!(req.headers["Authorization"], "Bearer t");
        assert_eq!(req.json, Some(json!({"id": 7})));
    }

    #[test]
    fn test_prepare_missing_variable() {
        let err = PreparedCase::prepare(&request_case("/u/${nobody}"), &vars()).unwrap_err();
        assert!(matches!(err, Error::MissingVariable { .. }));
    }

    #[test]
    fn test_probes_merge_locators() {
        let mut case = request_case("/");
        case.action = Action::Steps(vec![Step::Navigate { url: "/".into() }]);
        case.assertions = vec![serde_json::from_value(
            json!({"type": "element_visible", "locator": "#name"}),
        )
        .unwrap()];
        case.extract = vec![Extraction {
            name: "uid".into(),
            kind: ExtractionKind::ElementAttribute,
            path: "#name".into(),
            attribute: Some("data-id".into()),
            group: None,
            scope: ExtractScope::Local,
        }];
        let prepared = PreparedCase::prepare(&case, &vars()).unwrap();
        assert_eq!(
            prepared.probes(),
            vec![Probe {
                locator: "#name".into(),
                attributes: vec!["data-id".into()]
            }]
        );
    }

    #[tokio::test]
    async fn test_transport_errors_are_retried() {
        let backend = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let executor = Executor::new(BackendRegistry::new().with(backend.clone()), &config(2));
        let execution = executor.execute(&request_case("/"), &vars()).await;
        assert!(execution.result.is_ok());
        assert_eq!(execution.attempts, 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let backend = Arc::new(Flaky {
            failures: 5,
            calls: AtomicU32::new(0),
        });
        let executor = Executor::new(BackendRegistry::new().with(backend), &config(1));
        let execution = executor.execute(&request_case("/"), &vars()).await;
        assert!(matches!(execution.result, Err(Error::BackendTransport(_))));
        assert_eq!(execution.attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_backend() {
        let executor = Executor::new(BackendRegistry::new(), &config(0));
        let execution = executor.execute(&request_case("/"), &vars()).await;
        assert!(matches!(execution.result, Err(Error::BackendUnavailable(cap)) if cap == "request"));
        assert_eq!(execution.attempts, 0);
    }
}
