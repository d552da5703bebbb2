//! Template resolution and data-driven expansion
//!
//! Turns the `test_cases` entries of a suite into concrete [`Case`] values.
//! Templated entries produce one case per dataset record (or one for an
//! inline parameter set); template bodies are never modified.

use kwrun_common::{
    Case, CaseBody, CaseEntry, Error, Record, Result, SuiteSpec, Template, TemplateLibrary,
};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::condition;
use crate::vars::{lookup, render, replace_tokens, resolve_tree, token_names};

/// Item lists that may carry a `condition` filter
const FILTERED_LISTS: [&str; 3] = ["assertions", "extract", "steps"];

/// Resolve every entry of a suite into concrete cases, in declaration order
///
/// `library` holds shared templates and datasets; the suite's own
/// definitions take precedence over it.
pub fn resolve(suite: &SuiteSpec, library: &TemplateLibrary) -> Result<Vec<Case>> {
    let library = library.layered(suite);
    let mut cases = Vec::new();
    // entry name -> names of the cases generated from it
    let mut generated: HashMap<String, Vec<String>> = HashMap::new();

    for entry in &suite.test_cases {
        let entry_name = entry
            .name()
            .ok_or_else(|| Error::InvalidCase {
                case: format!("#{}", cases.len()),
                reason: "entry has neither `case_name` nor `template`".to_string(),
            })?
            .to_string();

        let mut produced = if entry.is_templated() {
            expand_entry(entry, &entry_name, &library, &suite.test_info.variables)?
        } else {
            vec![concrete_case(entry, &entry_name, &suite.test_info.variables)?]
        };
        for case in &mut produced {
            case.tags.extend(suite.test_info.tags.iter().cloned());
        }

        generated
            .entry(entry_name)
            .or_default()
            .extend(produced.iter().map(|c| c.name.clone()));
        cases.extend(produced);
    }

    let mut seen = HashSet::new();
    for case in &cases {
        if !seen.insert(case.name.as_str()) {
            return Err(Error::DuplicateCase(case.name.clone()));
        }
    }

    // a dependency on a templated entry means every case generated from it
    for case in &mut cases {
        let mut expanded = Vec::new();
        for dep in &case.depends_on {
            match generated.get(dep) {
                Some(names) if !(names.len() == 1 && &names[0] == dep) => {
                    expanded.extend(names.iter().cloned())
                }
                _ => expanded.push(dep.clone()),
            }
        }
        case.depends_on = expanded;
    }

    info!(
        "Resolved {} case(s) from suite '{}'",
        cases.len(),
        suite.test_info.title
    );
    Ok(cases)
}

fn concrete_case(entry: &CaseEntry, name: &str, suite_vars: &Record) -> Result<Case> {
    let (body, unresolved) = filter_items(Value::Object(entry.body.clone()), suite_vars);
    let mut case = build_case(
        entry,
        name.to_string(),
        body,
        entry.condition.clone(),
        BTreeSet::new(),
        None,
    )?;
    case.unresolved = unresolved;
    Ok(case)
}

fn expand_entry(
    entry: &CaseEntry,
    name: &str,
    library: &TemplateLibrary,
    suite_vars: &Record,
) -> Result<Vec<Case>> {
    let template_name = entry.template.as_deref().unwrap_or_default();
    let template = library
        .templates
        .get(template_name)
        .ok_or_else(|| Error::template(name, format!("unknown template '{}'", template_name)))?;

    let records: Vec<(Option<usize>, &Record)> = match (&entry.dataset, &entry.parameters) {
        (Some(dataset), None) => library
            .datasets
            .get(dataset)
            .ok_or_else(|| Error::template(name, format!("unknown dataset '{}'", dataset)))?
            .iter()
            .enumerate()
            .map(|(i, record)| (Some(i), record))
            .collect(),
        (None, Some(parameters)) => vec![(None, parameters)],
        (Some(_), Some(_)) => {
            return Err(Error::template(
                name,
                "use either `dataset` or `parameters`, not both",
            ))
        }
        (None, None) => {
            return Err(Error::template(
                name,
                "templated entry needs a `dataset` or `parameters`",
            ))
        }
    };

    debug!(
        "Expanding template '{}' for '{}' over {} record(s)",
        template_name,
        name,
        records.len()
    );

    let mut cases = Vec::with_capacity(records.len());
    for (index, record) in records {
        let case_name = match index {
            Some(i) => format!("{}[{}]", name, i),
            None => name.to_string(),
        };
        let (body, unresolved) = expand_record(entry, template, record, suite_vars)
            .map_err(|e| match e {
                Error::TemplateResolution { .. } | Error::InvalidCase { .. } => e,
                other => Error::template(&case_name, other.to_string()),
            })
            .map_err(|e| rename_case(e, &case_name))?;

        let mut tags: BTreeSet<String> = BTreeSet::new();
        if let Some(Value::Array(extra)) = record.get("tags") {
            tags.extend(extra.iter().filter_map(|t| t.as_str().map(String::from)));
        }
        let label = record.get("name").and_then(Value::as_str);
        let condition = entry
            .condition
            .as_deref()
            .map(|expr| {
                replace_tokens(expr, |token| Ok(lookup(record, token).map(|v| render(&v))))
            })
            .transpose()?;
        let mut case = build_case(entry, case_name, body, condition, tags, label)?;
        case.unresolved = unresolved;
        cases.push(case);
    }
    Ok(cases)
}

/// Substitute one record into a template body, apply overrides and item filters
fn expand_record(
    entry: &CaseEntry,
    template: &Template,
    record: &Record,
    suite_vars: &Record,
) -> Result<(Value, Option<String>)> {
    let declared: HashSet<&str> = template.parameters.iter().map(String::as_str).collect();
    for param in &declared {
        if !record.contains_key(*param) {
            return Err(Error::template(
                "",
                format!("record is missing parameter '{}'", param),
            ));
        }
    }

    let mut body = bind_parameters(&template.body, record, &declared)?;
    if let Some(overrides) = &entry.overrides {
        let overrides = bind_parameters(&Value::Object(overrides.clone()), record, &declared)?;
        apply_overrides(&mut body, overrides);
    }

    // item conditions see suite variables overlaid by the record
    let mut scope = suite_vars.clone();
    scope.extend(record.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(filter_items(body, &scope))
}

/// Replace parameter tokens; tokens naming anything else are left for run time
fn bind_parameters(body: &Value, record: &Record, declared: &HashSet<&str>) -> Result<Value> {
    let mut unresolved: Option<String> = None;
    let bound = resolve_tree(body, false, &mut |name: &str| {
        let root = name.split('.').next().unwrap_or(name);
        let is_parameter = declared.contains(root) || record.contains_key(root);
        match lookup(record, name) {
            Some(value) => Ok(Some(value)),
            None if is_parameter => {
                unresolved.get_or_insert_with(|| name.to_string());
                Ok(None)
            }
            None => Ok(None),
        }
    })?;

    match unresolved {
        Some(token) => Err(Error::template(
            "",
            format!("parameter token '${{{}}}' could not be resolved", token),
        )),
        None => Ok(bound),
    }
}

/// Merge overrides into a body: objects merge key-wise, everything else replaces
fn apply_overrides(body: &mut Value, overrides: Value) {
    let (Value::Object(target), Value::Object(overrides)) = (body, overrides) else {
        return;
    };
    for (key, value) in overrides {
        match (target.get_mut(&key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => existing.extend(incoming),
            (_, value) => {
                target.insert(key, value);
            }
        }
    }
}

/// Drop list items whose `condition` is false and strip the key from the rest
///
/// A condition that cannot be evaluated keeps its item and is reported back;
/// only the case carrying it fails.
fn filter_items(mut body: Value, scope: &Record) -> (Value, Option<String>) {
    let mut unresolved = None;
    if let Value::Object(map) = &mut body {
        for list in FILTERED_LISTS {
            let Some(Value::Array(items)) = map.get_mut(list) else {
                continue;
            };
            let mut kept = Vec::with_capacity(items.len());
            for mut item in items.drain(..) {
                let keep = match item.as_object_mut().and_then(|o| o.remove("condition")) {
                    Some(Value::String(expr)) => match condition::evaluate(&expr, scope) {
                        Ok(keep) => keep,
                        Err(e) => {
                            warn!("Condition on a {} item cannot be evaluated: {}", list, e);
                            unresolved.get_or_insert_with(|| format!("{} condition: {}", list, e));
                            true
                        }
                    },
                    Some(Value::Bool(flag)) => flag,
                    _ => true,
                };
                if keep {
                    kept.push(item);
                }
            }
            *items = kept;
        }
    }
    (body, unresolved)
}

fn build_case(
    entry: &CaseEntry,
    name: String,
    body: Value,
    condition: Option<String>,
    extra_tags: BTreeSet<String>,
    label: Option<&str>,
) -> Result<Case> {
    let mut parsed = CaseBody::from_value(&name, body)?;
    let action = parsed.take_action(&name)?;

    let description = match (parsed.description.take(), label) {
        (Some(desc), Some(label)) => format!("{} ({})", desc, label),
        (Some(desc), None) => desc,
        (None, Some(label)) => label.to_string(),
        (None, None) => String::new(),
    };

    let mut tags = entry.tags.clone();
    tags.extend(extra_tags);

    Ok(Case {
        name,
        description,
        tags,
        condition,
        depends_on: entry.depends_on.iter().cloned().collect(),
        action,
        assertions: parsed.assertions,
        extract: parsed.extract,
        unresolved: None,
    })
}

/// Errors raised before the case name is known carry an empty name
fn rename_case(err: Error, case: &str) -> Error {
    match err {
        Error::TemplateResolution { case: c, reason } if c.is_empty() => Error::TemplateResolution {
            case: case.to_string(),
            reason,
        },
        other => other,
    }
}

/// Names of the `${...}` tokens left in a resolved case, i.e. its run-time inputs
pub fn runtime_inputs(case: &Case) -> BTreeSet<String> {
    let Ok(value) = serde_json::to_value(case) else {
        return BTreeSet::new();
    };
    let mut names = BTreeSet::new();
    collect_tokens(&value, &mut names);
    names
}

fn collect_tokens(value: &Value, names: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => names.extend(token_names(s)),
        Value::Array(items) => items.iter().for_each(|v| collect_tokens(v, names)),
        Value::Object(map) => map.values().for_each(|v| collect_tokens(v, names)),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kwrun_common::Action;
    use serde_json::json;

    const SUITE: &str = r#"
test_info:
  title: Accounts
  tags: [accounts]
  variables:
    env: prod

templates:
  login:
    parameters: [username, password, expected_code]
    body:
      description: Login attempt
      request:
        method: POST
        url: /api/login
        headers:
          X-Trace: "${trace_id}"
        json:
          username: "${username}"
          password: "${password}"
          attempts: "${expected_code}"
      assertions:
        - type: status_code
          expected: "${expected_code}"
        - type: json_path
          path: $.token
          operator: not_empty
          condition: "${expected_code} == 200"
      extract:
        - name: token
          path: $.token
          condition: "${expected_code} == 200"

datasets:
  logins:
    - username: alice
      password: secret
      expected_code: 200
      name: valid
      tags: [happy]
    - username: bob
      password: wrong
      expected_code: 401

test_cases:
  - case_name: login
    template: login
    dataset: logins
    tags: [auth]
    condition: "${expected_code} != 500 and ${env} == prod"
  - case_name: profile
    depends_on: login
    request:
      url: /api/me
      headers:
        Authorization: "Bearer ${token}"
    assertions:
      - type: status_code
        expected: 200
      - type: header
        path: x-env
        expected: prod
        condition: "${env} == staging"
"#;

    fn suite() -> SuiteSpec {
        SuiteSpec::from_yaml(SUITE).unwrap()
    }

    #[test]
    fn test_dataset_expansion_names_and_values() {
        let cases = resolve(&suite(), &TemplateLibrary::default()).unwrap();
        let names: Vec<_> = cases.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["login[0]", "login[1]", "profile"]);

        let Action::Request(req) = &cases[0].action else {
            panic!("expected request action");
        };
        assert_eq!(req.method, "POST");
        let json = req.json.as_ref().unwrap();
        assert_eq!(json["username"], json!("alice"));
        // parameters keep their type inside free-form payloads
        assert_eq!(json["attempts"], json!(200));
        assert_eq!(cases[0].assertions[0].expected, Some(json!(200)));
        // runtime tokens survive expansion
        assert_eq!(req.headers["X-Trace"], "${trace_id}");
    }

    #[test]
    fn test_record_tags_and_label() {
        let cases = resolve(&suite(), &TemplateLibrary::default()).unwrap();
        assert!(cases[0].tags.contains("auth"));
        assert!(cases[2].tags.contains("accounts"));
        assert!(cases[0].tags.contains("happy"));
        assert!(!cases[1].tags.contains("happy"));
        assert_eq!(cases[0].description, "Login attempt (valid)");
    }

    #[test]
    fn test_conditional_items_filtered_per_record() {
        let cases = resolve(&suite(), &TemplateLibrary::default()).unwrap();
        assert_eq!(cases[0].assertions.len(), 2);
        assert_eq!(cases[0].extract.len(), 1);
        assert_eq!(cases[1].assertions.len(), 1);
        assert!(cases[1].extract.is_empty());
        // concrete entries filter against suite variables
        assert_eq!(cases[2].assertions.len(), 1);
    }

    #[test]
    fn test_case_condition_binds_record_values_only() {
        let cases = resolve(&suite(), &TemplateLibrary::default()).unwrap();
        assert_eq!(
            cases[1].condition.as_deref(),
            Some("401 != 500 and ${env} == prod")
        );
    }

    #[test]
    fn test_dependency_on_templated_entry_expands() {
        let cases = resolve(&suite(), &TemplateLibrary::default()).unwrap();
        assert_eq!(cases[2].depends_on, vec!["login[0]", "login[1]"]);
    }

    #[test]
    fn test_template_body_untouched() {
        let suite = suite();
        let before = serde_json::to_string(&suite.templates["login"].body).unwrap();
        resolve(&suite, &TemplateLibrary::default()).unwrap();
        let after = serde_json::to_string(&suite.templates["login"].body).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_inline_parameters_with_override() {
        let yaml = r#"
test_info: { title: t }
templates:
  ping:
    parameters: [path]
    body:
      request: { url: "${path}", headers: { Accept: text/plain } }
test_cases:
  - case_name: ping_health
    template: ping
    parameters: { path: /health }
    override:
      request: { headers: { X-Probe: "${path}" } }
"#;
        let cases = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &TemplateLibrary::default())
            .unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "ping_health");
        let Action::Request(req) = &cases[0].action else {
            panic!("expected request action");
        };
        // `request` merges key-wise, so the override replaces the headers object
        assert_eq!(req.url, "/health");
        assert_eq!(req.headers.get("X-Probe").map(String::as_str), Some("/health"));
        assert!(req.headers.get("Accept").is_none());
    }

    #[test]
    fn test_missing_parameter_is_resolution_error() {
        let yaml = r#"
test_info: { title: t }
templates:
  ping:
    parameters: [path]
    body:
      request: { url: "${path}" }
datasets:
  bad:
    - other: x
test_cases:
  - case_name: p
    template: ping
    dataset: bad
"#;
        let err = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &TemplateLibrary::default())
            .unwrap_err();
        assert!(matches!(err, Error::TemplateResolution { ref case, .. } if case == "p[0]"));
    }

    #[test]
    fn test_unknown_template_and_missing_data() {
        let yaml = r#"
test_info: { title: t }
test_cases:
  - case_name: p
    template: nope
    parameters: {}
"#;
        let err = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &TemplateLibrary::default())
            .unwrap_err();
        assert!(err.is_suite_fatal());

        let yaml = r#"
test_info: { title: t }
templates:
  ping:
    body: { request: { url: /x } }
test_cases:
  - template: ping
"#;
        let err = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &TemplateLibrary::default())
            .unwrap_err();
        assert!(matches!(err, Error::TemplateResolution { .. }));
    }

    #[test]
    fn test_shared_library_is_used() {
        let library = TemplateLibrary::from_yaml(
            r#"
templates:
  ping:
    parameters: [path]
    body: { request: { url: "${path}" } }
datasets:
  paths:
    - path: /a
    - path: /b
"#,
        )
        .unwrap();
        let yaml = r#"
test_info: { title: t }
test_cases:
  - case_name: ping
    template: ping
    dataset: paths
"#;
        let cases = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &library).unwrap();
        assert_eq!(cases.len(), 2);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let yaml = r#"
test_info: { title: t }
test_cases:
  - case_name: a
    request: { url: /a }
  - case_name: a
    request: { url: /b }
"#;
        let err = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &TemplateLibrary::default())
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateCase(name) if name == "a"));
    }

    #[test]
    fn test_unevaluable_item_condition_marks_only_its_case() {
        let yaml = r#"
test_info: { title: t }
test_cases:
  - case_name: login
    request: { url: /login }
  - case_name: profile
    request: { url: /profile }
    assertions:
      - type: status_code
        expected: 200
        condition: "${token} != none"
"#;
        let cases = resolve(&SuiteSpec::from_yaml(yaml).unwrap(), &TemplateLibrary::default())
            .unwrap();
        assert_eq!(cases.len(), 2);
        assert!(cases[0].unresolved.is_none());
        let reason = cases[1].unresolved.as_deref().unwrap();
        assert!(reason.contains("assertions condition"), "{reason}");
        assert!(reason.contains("${token}"), "{reason}");
        assert_eq!(cases[1].assertions.len(), 1);
    }

    #[test]
    fn test_runtime_inputs() {
        let cases = resolve(&suite(), &TemplateLibrary::default()).unwrap();
        let inputs = runtime_inputs(&cases[2]);
        assert!(inputs.contains("token"));
    }
}
