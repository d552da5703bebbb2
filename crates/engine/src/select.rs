//! Value selectors shared by assertions and extractions
//!
//! Every selector returns `Ok(None)` when its target is absent; only
//! malformed selectors (bad JSONPath, bad regex, failing SQL) are errors.

use jsonpath_lib::select;
use kwrun_common::{Error, QueryBackend, Result, Row};
use regex::{Regex, RegexBuilder};
use serde_json::Value;

/// Select with a JSONPath: no match is `None`, one match is that value,
/// several matches are collected into an array
pub fn json_path(document: &Value, path: &str) -> Result<Option<Value>> {
    let matches = select(document, path).map_err(|_| Error::InvalidJsonPath(path.to_string()))?;
    Ok(match matches.len() {
        0 => None,
        1 => Some(matches[0].clone()),
        _ => Some(Value::Array(matches.into_iter().cloned().collect())),
    })
}

/// Compile a user pattern; `.` also matches newlines
pub fn compile(pattern: &str) -> Result<Regex> {
    Ok(RegexBuilder::new(pattern).dot_matches_new_line(true).build()?)
}

/// First match of `pattern` in `text`, reporting capture `group` (0 = whole match)
///
/// A group the pattern does not define, or one that did not participate in
/// the match, yields `None`.
pub fn regex_capture(text: &str, pattern: &str, group: usize) -> Result<Option<String>> {
    let re = compile(pattern)?;
    Ok(re
        .captures(text)
        .and_then(|caps| caps.get(group).map(|m| m.as_str().to_string())))
}

/// First match of `pattern`: its first capture group when it has one, the
/// whole match otherwise
pub fn regex_first(text: &str, pattern: &str) -> Result<Option<String>> {
    let re = compile(pattern)?;
    let group = usize::from(re.captures_len() > 1);
    Ok(re
        .captures(text)
        .and_then(|caps| caps.get(group).map(|m| m.as_str().to_string())))
}

/// Run a query and shape its result: a single cell is returned as-is,
/// anything wider as an array of row objects
pub fn db_value(db: &dyn QueryBackend, sql: &str) -> Result<Option<Value>> {
    let rows = db.query(sql, &[])?;
    Ok(shape_rows(rows))
}

fn shape_rows(mut rows: Vec<Row>) -> Option<Value> {
    match rows.len() {
        0 => None,
        1 if rows[0].len() == 1 => rows.pop().and_then(|row| row.into_iter().next().map(|(_, v)| v)),
        _ => Some(Value::Array(rows.into_iter().map(Value::Object).collect())),
    }
}
