//! Error types for kwrun

use thiserror::Error;

/// Result type alias using the kwrun Error
pub type Result<T> = std::result::Result<T, Error>;

/// kwrun error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid regex: {0}")]
    Regex(#[from] regex::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Template resolution failed for '{case}': {reason}")]
    TemplateResolution { case: String, reason: String },

    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Case '{case}' depends on unknown case '{dependency}'")]
    UnknownDependency { case: String, dependency: String },

    #[error("Duplicate case name: {0}")]
    DuplicateCase(String),

    #[error("Invalid case '{case}': {reason}")]
    InvalidCase { case: String, reason: String },

    #[error("Missing variable: ${{{name}}}")]
    MissingVariable { name: String },

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Invalid JSONPath '{0}'")]
    InvalidJsonPath(String),

    #[error("Invalid condition '{expression}': {reason}")]
    InvalidCondition { expression: String, reason: String },

    #[error("Backend transport error: {0}")]
    BackendTransport(String),

    #[error("No backend registered for capability '{0}'")]
    BackendUnavailable(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Case timed out after {millis} ms")]
    Timeout { millis: u64 },
}

impl Error {
    /// Transport-level failures are the only errors the executor retries.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::BackendTransport(_))
    }

    /// Errors that abort a whole suite run before any case executes.
    pub fn is_suite_fatal(&self) -> bool {
        matches!(
            self,
            Error::TemplateResolution { .. }
                | Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateCase(_)
                | Error::InvalidCase { .. }
        )
    }

    pub fn template(case: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::TemplateResolution {
            case: case.into(),
            reason: reason.into(),
        }
    }
}
