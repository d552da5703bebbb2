//! Declarative case model parsed from YAML suites
//!
//! A suite file carries `test_info`, optional `templates` and `datasets`,
//! and an ordered `test_cases` list. Entries in `test_cases` are either
//! concrete cases or references to a template; the engine's template
//! resolver turns the latter into concrete [`Case`] values.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// A parameter binding: one dataset record, an inline parameter set, or seed variables
pub type Record = serde_json::Map<String, Value>;

/// Ordered records driving data-driven expansion of one template
pub type Dataset = Vec<Record>;

/// A suite as written on disk, before template expansion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub test_info: SuiteInfo,

    /// Suite-local templates, keyed by name
    #[serde(default)]
    pub templates: BTreeMap<String, Template>,

    /// Suite-local datasets, keyed by name
    #[serde(default)]
    pub datasets: BTreeMap<String, Dataset>,

    /// Cases in declaration order
    #[serde(default)]
    pub test_cases: Vec<CaseEntry>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteInfo {
    pub title: String,

    #[serde(default)]
    pub description: String,

    /// Tags applied to every case of the suite for filtering
    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Module name used by module filters; defaults to the file stem
    #[serde(default)]
    pub module: Option<String>,

    /// Seed variables written into the store when the run starts
    #[serde(default)]
    pub variables: Record,
}

/// One entry of `test_cases`
///
/// Concrete entries carry `request` or `steps` directly in `body`; templated
/// entries name a `template` plus either a `dataset` or inline `parameters`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseEntry {
    #[serde(default)]
    pub case_name: Option<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub depends_on: Option<String>,

    #[serde(default)]
    pub template: Option<String>,

    #[serde(default)]
    pub dataset: Option<String>,

    #[serde(default)]
    pub parameters: Option<Record>,

    /// Fields merged over the template body after substitution
    #[serde(default, rename = "override")]
    pub overrides: Option<Record>,

    /// Remaining fields: description, request/steps, assertions, extract
    #[serde(flatten)]
    pub body: Record,
}

impl CaseEntry {
    /// Name of the entry, falling back to the template name for templated entries
    pub fn name(&self) -> Option<&str> {
        self.case_name.as_deref().or(self.template.as_deref())
    }

    pub fn is_templated(&self) -> bool {
        self.template.is_some()
    }
}

/// A parameterized case blueprint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Parameters every record must bind
    #[serde(default)]
    pub parameters: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,

    /// Case body with `${param}` placeholders, kept untyped until expansion
    pub body: Value,
}

/// The executable part of a case definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseBody {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub request: Option<Request>,

    #[serde(default)]
    pub steps: Option<Vec<Step>>,

    #[serde(default)]
    pub assertions: Vec<Assertion>,

    #[serde(default)]
    pub extract: Vec<Extraction>,
}

impl CaseBody {
    /// Parse an untyped body into a typed one
    pub fn from_value(case: &str, value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::InvalidCase {
            case: case.to_string(),
            reason: e.to_string(),
        })
    }

    /// Pick the single capability payload of this body
    pub fn take_action(&mut self, case: &str) -> Result<Action> {
        match (self.request.take(), self.steps.take()) {
            (Some(request), None) => Ok(Action::Request(request)),
            (None, Some(steps)) => Ok(Action::Steps(steps)),
            (Some(_), Some(_)) => Err(Error::InvalidCase {
                case: case.to_string(),
                reason: "a case declares either `request` or `steps`, not both".to_string(),
            }),
            (None, None) => Err(Error::InvalidCase {
                case: case.to_string(),
                reason: "a case must declare `request` or `steps`".to_string(),
            }),
        }
    }
}

/// A resolved, immutable case ready for planning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Case {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    #[serde(default)]
    pub condition: Option<String>,

    /// Names of prerequisite cases
    #[serde(default)]
    pub depends_on: Vec<String>,

    pub action: Action,

    #[serde(default)]
    pub assertions: Vec<Assertion>,

    #[serde(default)]
    pub extract: Vec<Extraction>,

    /// Why an item condition could not be evaluated at expansion; such a
    /// case fails without executing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unresolved: Option<String>,
}

/// Backend capability set a case needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Request,
    Steps,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Request => write!(f, "request"),
            Capability::Steps => write!(f, "steps"),
        }
    }
}

/// Capability payload of a case
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Request(Request),
    Steps(Vec<Step>),
}

impl Action {
    pub fn capability(&self) -> Capability {
        match self {
            Action::Request(_) => Capability::Request,
            Action::Steps(_) => Capability::Steps,
        }
    }
}

/// An HTTP request keyword
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_method")]
    pub method: String,

    pub url: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Query string parameters
    #[serde(default)]
    pub params: BTreeMap<String, Value>,

    /// JSON body
    #[serde(default)]
    pub json: Option<Value>,

    /// Form body
    #[serde(default)]
    pub data: Option<BTreeMap<String, Value>>,

    /// Raw text body
    #[serde(default)]
    pub body: Option<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A single browser keyword
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Navigate to a URL (relative to the backend base URL)
    Navigate {
        url: String,
    },

    Click {
        locator: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },

    /// Fill an input, clearing it first unless `clear` is false
    Input {
        locator: String,
        value: String,
        #[serde(default = "default_true")]
        clear: bool,
    },

    Select {
        locator: String,
        value: String,
    },

    Press {
        #[serde(default)]
        locator: Option<String>,
        key: String,
    },

    Hover {
        locator: String,
    },

    Check {
        locator: String,
    },

    Uncheck {
        locator: String,
    },

    WaitForElement {
        locator: String,
        #[serde(default)]
        state: WaitState,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    WaitForUrl {
        url: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    WaitForText {
        locator: String,
        text: String,
        #[serde(default = "default_wait_timeout")]
        timeout_ms: u64,
    },

    /// Fixed pause (use sparingly)
    Sleep {
        ms: u64,
    },

    Screenshot {
        name: String,
        #[serde(default)]
        full_page: bool,
    },

    ExecuteJs {
        script: String,
    },
}

impl Step {
    /// Short keyword label used in logs
    pub fn keyword(&self) -> String {
        match self {
            Step::Navigate { url } => format!("navigate:{}", url),
            Step::Click { locator, .. } => format!("click:{}", locator),
            Step::Input { locator, .. } => format!("input:{}", locator),
            Step::Select { locator, .. } => format!("select:{}", locator),
            Step::Press { key, .. } => format!("press:{}", key),
            Step::Hover { locator } => format!("hover:{}", locator),
            Step::Check { locator } => format!("check:{}", locator),
            Step::Uncheck { locator } => format!("uncheck:{}", locator),
            Step::WaitForElement { locator, .. } => format!("wait_for_element:{}", locator),
            Step::WaitForUrl { url, .. } => format!("wait_for_url:{}", url),
            Step::WaitForText { locator, .. } => format!("wait_for_text:{}", locator),
            Step::Sleep { ms } => format!("sleep:{}ms", ms),
            Step::Screenshot { name, .. } => format!("screenshot:{}", name),
            Step::ExecuteJs { .. } => "execute_js".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_wait_timeout() -> u64 {
    5000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitState {
    #[default]
    Visible,
    Hidden,
    Attached,
    Detached,
}

impl WaitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WaitState::Visible => "visible",
            WaitState::Hidden => "hidden",
            WaitState::Attached => "attached",
            WaitState::Detached => "detached",
        }
    }
}

/// A declarative check against an execution outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assertion {
    #[serde(rename = "type")]
    pub kind: AssertionKind,

    /// JSONPath, regex pattern, SQL query, header name or locator
    #[serde(default, alias = "locator", alias = "query", alias = "pattern")]
    pub path: Option<String>,

    /// Operator name; parsed at evaluation time so unknown names fail one case only
    #[serde(default)]
    pub operator: Option<String>,

    /// Expected value; `Some(Null)` when written as `null`, `None` when omitted
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub expected: Option<Value>,

    /// Registered check name for `custom` assertions
    #[serde(default)]
    pub function: Option<String>,

    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    StatusCode,
    JsonPath,
    Regex,
    DbQuery,
    ResponseTime,
    UrlContains,
    ElementVisible,
    ElementText,
    Header,
    Custom,
}

impl fmt::Display for AssertionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AssertionKind::StatusCode => "status_code",
            AssertionKind::JsonPath => "json_path",
            AssertionKind::Regex => "regex",
            AssertionKind::DbQuery => "db_query",
            AssertionKind::ResponseTime => "response_time",
            AssertionKind::UrlContains => "url_contains",
            AssertionKind::ElementVisible => "element_visible",
            AssertionKind::ElementText => "element_text",
            AssertionKind::Header => "header",
            AssertionKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// A rule pulling a value out of an outcome into the variable store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    pub name: String,

    #[serde(rename = "type", default)]
    pub kind: ExtractionKind,

    /// JSONPath, regex pattern, SQL query, header name or locator
    #[serde(alias = "query", alias = "pattern", alias = "locator")]
    pub path: String,

    /// Attribute name for `element_attribute`
    #[serde(default)]
    pub attribute: Option<String>,

    /// Capture group for `regex` (default 1, 0 = whole match)
    #[serde(default)]
    pub group: Option<usize>,

    #[serde(default)]
    pub scope: ExtractScope,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionKind {
    #[default]
    JsonPath,
    Regex,
    DbQuery,
    ElementAttribute,
    Header,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractScope {
    /// Published to every case scheduled after the extracting case
    #[default]
    #[serde(alias = "suite", alias = "suite_global")]
    Global,
    /// Reported with the case result only
    #[serde(alias = "case", alias = "case_local")]
    Local,
}

fn deserialize_present<'de, D>(deserializer: D) -> std::result::Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// Templates and datasets shared across suites
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateLibrary {
    #[serde(default)]
    pub templates: BTreeMap<String, Template>,

    #[serde(default)]
    pub datasets: BTreeMap<String, Dataset>,
}

impl TemplateLibrary {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    /// Load every YAML file in a directory and merge them; later files win on name clashes
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut library = Self::default();
        for path in yaml_files(dir) {
            let content = std::fs::read_to_string(&path)?;
            library.merge(Self::from_yaml(&content)?);
        }
        Ok(library)
    }

    pub fn merge(&mut self, other: TemplateLibrary) {
        self.templates.extend(other.templates);
        self.datasets.extend(other.datasets);
    }

    /// This library with a suite's local templates and datasets layered on top
    pub fn layered(&self, suite: &SuiteSpec) -> TemplateLibrary {
        let mut library = self.clone();
        library.templates.extend(suite.templates.clone());
        library.datasets.extend(suite.datasets.clone());
        library
    }
}

impl SuiteSpec {
    /// Parse a suite from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(Error::from)
    }

    /// Parse a suite from a YAML file; the module defaults to the file stem
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut suite = Self::from_yaml(&content)?;
        if suite.test_info.module.is_none() {
            suite.test_info.module = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string());
        }
        debug!("Loaded suite '{}' from {}", suite.test_info.title, path.display());
        Ok(suite)
    }

    /// Load a single file, or every suite file under a directory in path order
    pub fn load_all(path: &Path) -> Result<Vec<Self>> {
        if path.is_file() {
            return Ok(vec![Self::from_file(path)?]);
        }

        yaml_files(path).iter().map(|p| Self::from_file(p)).collect()
    }

    pub fn module(&self) -> Option<&str> {
        self.test_info.module.as_deref()
    }
}

fn yaml_files(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut files: Vec<_> = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}
