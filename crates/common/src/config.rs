//! Run configuration
//!
//! Loaded from TOML. A file may carry an `[environments.<name>]` table per
//! target environment; the selected one is merged over the root keys before
//! the configuration is deserialized.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::Record;

/// Configuration recognized by the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Run independent cases concurrently
    pub parallel: bool,

    /// Worker bound when `parallel` is set
    pub max_workers: usize,

    /// Extra attempts after a transport failure
    pub retry_times: u32,

    /// Fixed pause between attempts
    pub retry_backoff_ms: u64,

    /// Per-case timeout covering every attempt
    pub timeout_ms: u64,

    /// Whole-run deadline; reaching it marks the run partial
    pub suite_timeout_ms: Option<u64>,

    /// Only run cases carrying one of these tags (empty = all)
    pub case_tags: BTreeSet<String>,

    /// Only run suites from these modules (empty = all)
    pub case_modules: BTreeSet<String>,

    /// Run extractions even when assertions fail
    pub extract_on_failure: bool,

    /// Stop scheduling after the first case that does not pass
    pub fail_fast: bool,

    /// Global seed variables, applied before suite variables
    pub variables: Record,

    pub http: HttpConfig,

    pub browser: BrowserConfig,

    pub database: Option<DatabaseConfig>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            parallel: false,
            max_workers: 4,
            retry_times: 0,
            retry_backoff_ms: 500,
            timeout_ms: 30_000,
            suite_timeout_ms: None,
            case_tags: BTreeSet::new(),
            case_modules: BTreeSet::new(),
            extract_on_failure: true,
            fail_fast: false,
            variables: Record::new(),
            http: HttpConfig::default(),
            browser: BrowserConfig::default(),
            database: None,
        }
    }
}

/// HTTP backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Prefix for relative request URLs
    pub base_url: Option<String>,

    /// Headers sent with every request
    pub headers: BTreeMap<String, String>,

    /// Client-level request timeout; the per-case timeout still applies
    pub timeout_ms: Option<u64>,
}

/// Browser backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub base_url: String,

    /// chromium, firefox or webkit
    pub browser: String,

    pub headless: bool,

    pub viewport_width: u32,

    pub viewport_height: u32,

    pub screenshot_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            browser: "chromium".to_string(),
            headless: true,
            viewport_width: 1280,
            viewport_height: 720,
            screenshot_dir: PathBuf::from("test-results/screenshots"),
        }
    }
}

/// Database used by `db_query` assertions and extractions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl RunConfig {
    /// Load configuration from file, selecting an environment overlay if given
    pub fn load(path: &Path, environment: Option<&str>) -> Result<Self> {
        if !path.exists() {
            if let Some(name) = environment {
                return Err(Error::InvalidConfig(format!(
                    "environment '{}' requested but {} does not exist",
                    name,
                    path.display()
                )));
            }
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content, environment)
    }

    pub fn from_toml(content: &str, environment: Option<&str>) -> Result<Self> {
        let mut root: toml::Table = toml::from_str(content)?;
        let environments = root.remove("environments");

        if let Some(name) = environment {
            let overlay = environments
                .as_ref()
                .and_then(|envs| envs.get(name))
                .and_then(|env| env.as_table())
                .ok_or_else(|| {
                    Error::InvalidConfig(format!("environment '{}' is not defined", name))
                })?;
            debug!("Applying environment overlay '{}'", name);
            merge_tables(&mut root, overlay);
        }

        let config: Self = toml::Value::Table(root).try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallel && self.max_workers == 0 {
            return Err(Error::InvalidConfig(
                "max_workers must be at least 1 when parallel is enabled".to_string(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::InvalidConfig("timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    /// Number of cases allowed in flight at once
    pub fn worker_count(&self) -> usize {
        if self.parallel {
            self.max_workers.max(1)
        } else {
            1
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn suite_timeout(&self) -> Option<Duration> {
        self.suite_timeout_ms.map(Duration::from_millis)
    }
}

fn merge_tables(base: &mut toml::Table, overlay: &toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
parallel = true
max_workers = 8
retry_times = 2
case_tags = ["smoke"]

[http]
base_url = "http://dev.local"

[http.headers]
x-env = "dev"

[environments.prod]
max_workers = 2

[environments.prod.http]
base_url = "https://prod.example.com"
"#;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.worker_count(), 1);
        assert!(config.extract_on_failure);
        assert_eq!(config.timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_root() {
        let config = RunConfig::from_toml(CONFIG, None).unwrap();
        assert!(config.parallel);
        assert_eq!(config.worker_count(), 8);
        assert_eq!(config.retry_times, 2);
        assert!(config.case_tags.contains("smoke"));
        assert_eq!(config.http.base_url.as_deref(), Some("http://dev.local"));
    }

    #[test]
    fn test_environment_overlay_merges_nested_tables() {
        let config = RunConfig::from_toml(CONFIG, Some("prod")).unwrap();
        assert_eq!(config.max_workers, 2);
        assert_eq!(config.http.base_url.as_deref(), Some("https://prod.example.com"));
        // untouched nested keys survive the overlay
        assert_eq!(config.http.headers.get("x-env").map(String::as_str), Some("dev"));
    }

    #[test]
    fn test_unknown_environment() {
        let err = RunConfig::from_toml(CONFIG, Some("staging")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = RunConfig::load(Path::new("/nonexistent/kwrun.toml"), None).unwrap();
        assert!(!config.parallel);
    }

    #[test]
    fn test_environment_without_file_is_rejected() {
        let err = RunConfig::load(Path::new("/nonexistent/kwrun.toml"), Some("ci")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(ref msg) if msg.contains("'ci'")));
    }
}
