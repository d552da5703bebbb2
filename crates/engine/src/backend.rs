//! Backend seam between the executor and the systems under test

use kwrun_common::{Action, Capability, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// A DOM element the browser backend should report on after the steps ran
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Probe {
    pub locator: String,
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Everything a backend needs for one attempt
#[derive(Debug, Clone)]
pub struct Payload {
    pub case_name: String,
    pub action: Action,
    pub probes: Vec<Probe>,
}

/// State of one probed element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementSnapshot {
    pub visible: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Option<String>>,
}

/// Result of executing a case's action, as seen by assertions and extractions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    /// HTTP status code
    pub status: Option<u16>,

    /// Final URL (browser) or request URL (HTTP)
    pub url: Option<String>,

    /// Parsed JSON body, `Null` when the body is not JSON
    pub body: Value,

    /// Raw response text
    pub text: String,

    /// Response headers with lowercased names
    pub headers: BTreeMap<String, String>,

    /// Probed elements keyed by locator
    pub elements: BTreeMap<String, ElementSnapshot>,

    #[serde(with = "duration_ms")]
    pub elapsed: Duration,

    /// Backend-specific record kept for reports
    pub raw: Value,
}

impl ExecutionOutcome {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

/// A system that can execute one kind of action
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Capability this backend serves
    fn capability(&self) -> Capability;

    /// Execute one attempt of an action
    ///
    /// Transport-level failures must be reported as
    /// `Error::BackendTransport` so the executor can retry them.
    async fn execute(&self, payload: &Payload) -> Result<ExecutionOutcome>;
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let mut outcome = ExecutionOutcome::default();
        outcome.headers.insert("content-type".into(), "application/json".into());
        assert_eq!(outcome.header("Content-Type"), Some("application/json"));
        assert_eq!(outcome.header("x-missing"), None);
    }

    #[test]
    fn test_elapsed_serializes_as_millis() {
        let outcome = ExecutionOutcome {
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["elapsed"], json!(1500));
    }
}
