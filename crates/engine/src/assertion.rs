//! Assertion evaluation
//!
//! Every assertion of a case is evaluated, even after one fails, so a
//! result always lists all failures. Operator names are parsed per
//! assertion: an unknown name fails that assertion only.

use kwrun_common::{redact_text, Assertion, AssertionKind, Error, QueryBackend, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::backend::ExecutionOutcome;
use crate::select;
use crate::vars::render;

/// Comparison applied between the resolved target and `expected`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    NotEmpty,
    Empty,
    Null,
    NotNull,
    Contains,
    NotContains,
    LengthEquals,
    LengthGreater,
    LengthGreaterEqual,
    LengthLess,
    LengthLessEqual,
    GreaterThan,
    GreaterEqual,
    LessThan,
    LessEqual,
    Matches,
    NotMatches,
    StartsWith,
    EndsWith,
    Type,
}

impl FromStr for Operator {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim() {
            "equals" | "eq" | "==" => Operator::Equals,
            "not_equals" | "ne" | "!=" => Operator::NotEquals,
            "not_empty" => Operator::NotEmpty,
            "empty" => Operator::Empty,
            "null" | "none" => Operator::Null,
            "not_null" | "not_none" => Operator::NotNull,
            "contains" | "in" => Operator::Contains,
            "not_contains" | "not_in" => Operator::NotContains,
            "length_equals" | "length" => Operator::LengthEquals,
            "length_gt" => Operator::LengthGreater,
            "length_ge" => Operator::LengthGreaterEqual,
            "length_lt" => Operator::LengthLess,
            "length_le" => Operator::LengthLessEqual,
            "greater_than" | "gt" | ">" => Operator::GreaterThan,
            "greater_equal" | "ge" | ">=" => Operator::GreaterEqual,
            "less_than" | "lt" | "<" => Operator::LessThan,
            "less_equal" | "le" | "<=" => Operator::LessEqual,
            "matches" | "regex" | "match" => Operator::Matches,
            "not_matches" | "not_regex" | "not_match" => Operator::NotMatches,
            "starts_with" | "startswith" => Operator::StartsWith,
            "ends_with" | "endswith" => Operator::EndsWith,
            "type" => Operator::Type,
            other => return Err(Error::UnsupportedOperator(other.to_string())),
        })
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::NotEmpty => "not_empty",
            Operator::Empty => "empty",
            Operator::Null => "null",
            Operator::NotNull => "not_null",
            Operator::Contains => "contains",
            Operator::NotContains => "not_contains",
            Operator::LengthEquals => "length_equals",
            Operator::LengthGreater => "length_gt",
            Operator::LengthGreaterEqual => "length_ge",
            Operator::LengthLess => "length_lt",
            Operator::LengthLessEqual => "length_le",
            Operator::GreaterThan => "greater_than",
            Operator::GreaterEqual => "greater_equal",
            Operator::LessThan => "less_than",
            Operator::LessEqual => "less_equal",
            Operator::Matches => "matches",
            Operator::NotMatches => "not_matches",
            Operator::StartsWith => "starts_with",
            Operator::EndsWith => "ends_with",
            Operator::Type => "type",
        };
        f.write_str(name)
    }
}

impl Operator {
    /// Apply the operator; `actual` is `None` when the target was not found
    pub fn apply(&self, actual: Option<&Value>, expected: &Value) -> Result<bool> {
        let Some(actual) = actual else {
            return Ok(match self {
                Operator::Equals => expected.is_null(),
                Operator::NotEquals => !expected.is_null(),
                Operator::Empty | Operator::Null | Operator::NotContains | Operator::NotMatches => {
                    true
                }
                _ => false,
            });
        };

        Ok(match self {
            Operator::Equals => loose_eq(actual, expected),
            Operator::NotEquals => !loose_eq(actual, expected),
            Operator::NotEmpty => !is_empty(actual),
            Operator::Empty => is_empty(actual),
            Operator::Null => actual.is_null(),
            Operator::NotNull => !actual.is_null(),
            Operator::Contains => contains(actual, expected),
            Operator::NotContains => !contains(actual, expected),
            Operator::LengthEquals
            | Operator::LengthGreater
            | Operator::LengthGreaterEqual
            | Operator::LengthLess
            | Operator::LengthLessEqual => {
                let (Some(len), Some(want)) = (length(actual), as_number(expected)) else {
                    return Ok(false);
                };
                let len = len as f64;
                match self {
                    Operator::LengthEquals => len == want,
                    Operator::LengthGreater => len > want,
                    Operator::LengthGreaterEqual => len >= want,
                    Operator::LengthLess => len < want,
                    _ => len <= want,
                }
            }
            Operator::GreaterThan
            | Operator::GreaterEqual
            | Operator::LessThan
            | Operator::LessEqual => {
                let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) else {
                    return Ok(false);
                };
                match self {
                    Operator::GreaterThan => a > b,
                    Operator::GreaterEqual => a >= b,
                    Operator::LessThan => a < b,
                    _ => a <= b,
                }
            }
            Operator::Matches => select::compile(&render(expected))?.is_match(&render(actual)),
            Operator::NotMatches => !select::compile(&render(expected))?.is_match(&render(actual)),
            Operator::StartsWith => render(actual).starts_with(&render(expected)),
            Operator::EndsWith => render(actual).ends_with(&render(expected)),
            Operator::Type => type_matches(actual, &render(expected)),
        })
    }
}

/// Equality that coerces between numbers, numeric strings and booleans
pub fn loose_eq(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (actual, expected) {
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => false,
        (Value::Bool(b), other) | (other, Value::Bool(b)) => as_bool(other) == Some(*b),
        _ => match (as_number(actual), as_number(expected)) {
            (Some(a), Some(b)) => a == b,
            _ => render(actual) == render(expected),
        },
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        _ => None,
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        Value::Object(map) => map.contains_key(&render(expected)),
        other => render(other).contains(&render(expected)),
    }
}

fn length(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        Value::Object(map) => Some(map.len()),
        _ => None,
    }
}

fn type_matches(value: &Value, name: &str) -> bool {
    match name {
        "string" | "str" => value.is_string(),
        "number" | "float" => value.is_number(),
        "int" | "integer" => value.is_i64() || value.is_u64(),
        "bool" | "boolean" => value.is_boolean(),
        "array" | "list" => value.is_array(),
        "object" | "dict" => value.is_object(),
        "null" | "none" | "NoneType" => value.is_null(),
        _ => false,
    }
}

/// Outcome of a single assertion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssertionResult {
    #[serde(rename = "type")]
    pub kind: AssertionKind,
    pub path: Option<String>,
    pub operator: String,
    pub expected: Value,
    pub actual: Option<Value>,
    pub passed: bool,
    pub message: String,
    pub error: Option<String>,
}

/// A named check used by `custom` assertions
pub type CustomCheck = Arc<dyn Fn(&ExecutionOutcome, &Assertion) -> Result<bool> + Send + Sync>;

/// Evaluates assertions against an outcome
#[derive(Clone, Default)]
pub struct AssertionEngine {
    db: Option<Arc<dyn QueryBackend>>,
    checks: HashMap<String, CustomCheck>,
}

impl AssertionEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, db: Arc<dyn QueryBackend>) -> Self {
        self.db = Some(db);
        self
    }

    /// Register a named check for `custom` assertions
    pub fn register<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&ExecutionOutcome, &Assertion) -> Result<bool> + Send + Sync + 'static,
    {
        self.checks.insert(name.into(), Arc::new(check));
    }

    /// Evaluate every assertion; never stops at the first failure
    pub fn evaluate(
        &self,
        outcome: &ExecutionOutcome,
        assertions: &[Assertion],
    ) -> Vec<AssertionResult> {
        assertions
            .iter()
            .map(|assertion| self.evaluate_one(outcome, assertion))
            .collect()
    }

    fn evaluate_one(&self, outcome: &ExecutionOutcome, assertion: &Assertion) -> AssertionResult {
        let expected = default_expected(assertion);
        let operator_name = assertion
            .operator
            .clone()
            .unwrap_or_else(|| default_operator(assertion).to_string());

        let mut result = AssertionResult {
            kind: assertion.kind,
            path: assertion.path.clone(),
            operator: operator_name.clone(),
            expected: expected.clone(),
            actual: None,
            passed: false,
            message: String::new(),
            error: None,
        };

        let outcome_of = || -> Result<(Option<Value>, bool)> {
            if assertion.kind == AssertionKind::Custom {
                let name = assertion.function.as_deref().unwrap_or_default();
                let check = self
                    .checks
                    .get(name)
                    .ok_or_else(|| Error::Backend(format!("no custom check named '{}'", name)))?;
                return Ok((None, check(outcome, assertion)?));
            }
            let operator: Operator = operator_name.parse()?;
            let actual = self.actual(outcome, assertion)?;
            let passed = operator.apply(actual.as_ref(), &expected)?;
            Ok((actual, passed))
        };

        match outcome_of() {
            Ok((actual, passed)) => {
                result.actual = actual;
                result.passed = passed;
                result.message = if passed {
                    format!("{} {} passed", assertion.kind, operator_name)
                } else {
                    assertion.message.clone().unwrap_or_else(|| {
                        format!(
                            "{}{} {} {}: actual {}",
                            assertion.kind,
                            assertion
                                .path
                                .as_deref()
                                .map(|p| format!(" '{}'", p))
                                .unwrap_or_default(),
                            operator_name,
                            expected,
                            result
                                .actual
                                .as_ref()
                                .map(Value::to_string)
                                .unwrap_or_else(|| "<not found>".to_string())
                        )
                    })
                };
            }
            Err(e) => {
                result.message = assertion.message.clone().unwrap_or_else(|| e.to_string());
                result.error = Some(e.to_string());
            }
        }

        debug!(
            "assertion {} {}: {}",
            assertion.kind,
            if result.passed { "passed" } else { "failed" },
            redact_text(&result.message)
        );
        result
    }

    /// Resolve the value an assertion looks at; `None` means not found
    fn actual(&self, outcome: &ExecutionOutcome, assertion: &Assertion) -> Result<Option<Value>> {
        let path = assertion.path.as_deref().unwrap_or_default();
        Ok(match assertion.kind {
            AssertionKind::StatusCode => outcome.status.map(|s| json!(s)),
            AssertionKind::ResponseTime => Some(json!(outcome.elapsed.as_millis() as u64)),
            AssertionKind::JsonPath => select::json_path(&outcome.body, path)?,
            AssertionKind::Regex => select::regex_first(&outcome.text, path)?.map(Value::String),
            AssertionKind::DbQuery => {
                let db = self
                    .db
                    .as_deref()
                    .ok_or_else(|| Error::Backend("no database configured".to_string()))?;
                select::db_value(db, path)?
            }
            AssertionKind::UrlContains => outcome.url.clone().map(Value::String),
            AssertionKind::Header => outcome.header(path).map(|v| Value::String(v.to_string())),
            AssertionKind::ElementVisible => {
                outcome.elements.get(path).map(|e| Value::Bool(e.visible))
            }
            AssertionKind::ElementText => outcome
                .elements
                .get(path)
                .and_then(|e| e.text.clone())
                .map(Value::String),
            AssertionKind::Custom => None,
        })
    }
}

fn default_operator(assertion: &Assertion) -> Operator {
    match assertion.kind {
        AssertionKind::UrlContains => Operator::Contains,
        AssertionKind::ResponseTime => Operator::LessEqual,
        AssertionKind::Regex if assertion.expected.is_none() => Operator::NotEmpty,
        _ => Operator::Equals,
    }
}

fn default_expected(assertion: &Assertion) -> Value {
    match (&assertion.expected, assertion.kind) {
        (Some(value), _) => value.clone(),
        (None, AssertionKind::ElementVisible) => Value::Bool(true),
        // `url_contains: /path` may carry the fragment in `path`
        (None, AssertionKind::UrlContains) => assertion
            .path
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        (None, _) => Value::Null,
    }
}
