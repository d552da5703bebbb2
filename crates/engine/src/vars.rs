//! Variable store and `${name}` substitution

use kwrun_common::{redact, redact_text, Error, Record, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, Level};

/// A point-in-time copy of the store
pub type Vars = HashMap<String, Value>;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("token pattern is valid")
});

/// Anything `${name}` tokens can be resolved against
pub trait Bindings {
    fn binding(&self, name: &str) -> Option<&Value>;
}

impl Bindings for Vars {
    fn binding(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

impl Bindings for Record {
    fn binding(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

/// Shared name to value map for one suite run
///
/// Readers take snapshots; writers hold the lock for a whole batch so a
/// case's extractions become visible together.
#[derive(Debug, Clone, Default)]
pub struct VariableStore {
    inner: Arc<RwLock<Vars>>,
}

impl VariableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded from records applied in order, later ones winning
    pub fn seeded<'a>(layers: impl IntoIterator<Item = &'a Record>) -> Self {
        let store = Self::new();
        for layer in layers {
            store.set_many(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        store
    }

    pub fn get(&self, name: &str) -> Result<Value> {
        lookup(&*self.inner.read(), name).ok_or_else(|| Error::MissingVariable {
            name: name.to_string(),
        })
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.inner.write().insert(name.into(), value);
    }

    /// Write a batch under a single lock acquisition
    pub fn set_many(&self, values: impl IntoIterator<Item = (String, Value)>) {
        let mut guard = self.inner.write();
        for (name, value) in values {
            guard.insert(name, value);
        }
    }

    pub fn snapshot(&self) -> Vars {
        self.inner.read().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

/// Resolve a name, walking into nested values for dotted names that are not bound directly
pub fn lookup<B: Bindings + ?Sized>(vars: &B, name: &str) -> Option<Value> {
    if let Some(value) = vars.binding(name) {
        return Some(value.clone());
    }

    let mut segments = name.split('.');
    let root = segments.next()?;
    let mut current = vars.binding(root)?;
    let mut walked = false;
    for segment in segments {
        walked = true;
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    walked.then(|| current.clone())
}

/// Render a value for interpolation into text
pub fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// True if the text contains at least one `${...}` token
pub fn has_tokens(text: &str) -> bool {
    TOKEN.is_match(text)
}

/// Names of every token in the text, in order of appearance
pub fn token_names(text: &str) -> Vec<String> {
    TOKEN
        .captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// If the whole text is exactly one token, its name
pub fn sole_token(text: &str) -> Option<&str> {
    let caps = TOKEN.captures(text)?;
    let whole = caps.get(0)?;
    (whole.start() == 0 && whole.end() == text.len()).then(|| caps.get(1).map(|m| m.as_str()))?
}

/// Replace tokens in one pass; `resolve` returns `None` to leave a token untouched
pub fn replace_tokens<F>(text: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for caps in TOKEN.captures_iter(text) {
        let whole = caps.get(0).map(|m| (m.start(), m.end()));
        let Some((start, end)) = whole else { continue };
        out.push_str(&text[last..start]);
        match resolve(&caps[1])? {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(&caps[0]),
        }
        last = end;
    }
    out.push_str(&text[last..]);
    Ok(out)
}

/// Substitute every token in `text`; a missing binding is an error
pub fn substitute<B: Bindings + ?Sized>(text: &str, vars: &B) -> Result<String> {
    if !has_tokens(text) {
        return Ok(text.to_string());
    }
    let resolved = replace_tokens(text, |name| {
        lookup(vars, name)
            .map(|value| Some(render(&value)))
            .ok_or_else(|| Error::MissingVariable {
                name: name.to_string(),
            })
    })?;
    if tracing::enabled!(Level::DEBUG) {
        let masked = replace_tokens(text, |name| {
            Ok(lookup(vars, name).map(|value| render(&redact(name, &value))))
        })?;
        debug!("substituted '{}' -> '{}'", text, redact_text(&masked));
    }
    Ok(resolved)
}

/// Keys holding free-form JSON; a sole token below them keeps its bound type
pub const TYPED_KEYS: [&str; 4] = ["json", "params", "data", "expected"];

/// Walk a JSON value and replace tokens in every string
///
/// `resolve` returns `None` to leave a token as written. A string that is
/// exactly one token takes the resolved value itself (not its rendering)
/// when `typed` is set or when it sits below one of [`TYPED_KEYS`].
pub fn resolve_tree<F>(value: &Value, typed: bool, resolve: &mut F) -> Result<Value>
where
    F: FnMut(&str) -> Result<Option<Value>>,
{
    Ok(match value {
        Value::String(s) => {
            if typed {
                if let Some(name) = sole_token(s) {
                    return Ok(resolve(name)?.unwrap_or_else(|| value.clone()));
                }
            }
            Value::String(replace_tokens(s, |name| {
                Ok(resolve(name)?.map(|v| render(&v)))
            })?)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_tree(item, typed, resolve))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                let typed = typed || TYPED_KEYS.contains(&key.as_str());
                out.insert(key.clone(), resolve_tree(item, typed, resolve)?);
            }
            Value::Object(out)
        }
        other => other.clone(),
    })
}

/// Substitute tokens in every string of a JSON value; a missing binding is an error
pub fn substitute_value<B: Bindings + ?Sized>(
    value: &Value,
    vars: &B,
    keep_types: bool,
) -> Result<Value> {
    resolve_tree(value, keep_types, &mut |name: &str| {
        lookup(vars, name)
            .map(Some)
            .ok_or_else(|| Error::MissingVariable {
                name: name.to_string(),
            })
    })
}
