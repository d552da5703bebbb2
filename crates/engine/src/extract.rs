//! Extraction of values from outcomes into the variable store

use kwrun_common::{
    redact, Error, ExtractScope, Extraction, ExtractionKind, QueryBackend, Result,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::backend::ExecutionOutcome;
use crate::select;
use crate::vars::VariableStore;

/// Values pulled out by one case, split by scope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedVars {
    /// Written to the store and visible to later cases
    pub global: BTreeMap<String, Value>,

    /// Reported with the case result only
    pub local: BTreeMap<String, Value>,
}

impl ExtractedVars {
    pub fn is_empty(&self) -> bool {
        self.global.is_empty() && self.local.is_empty()
    }

    pub fn len(&self) -> usize {
        self.global.len() + self.local.len()
    }
}

/// Resolves extraction rules against outcomes
#[derive(Clone, Default)]
pub struct Extractor {
    db: Option<Arc<dyn QueryBackend>>,
}

impl Extractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_database(mut self, db: Arc<dyn QueryBackend>) -> Self {
        self.db = Some(db);
        self
    }

    /// Resolve every rule and publish the global ones in a single store write
    ///
    /// A target that cannot be found yields `null`; a malformed rule is an error.
    pub fn extract(
        &self,
        outcome: &ExecutionOutcome,
        extractions: &[Extraction],
        store: &VariableStore,
    ) -> Result<ExtractedVars> {
        let mut extracted = ExtractedVars::default();

        for rule in extractions {
            let value = self.resolve(outcome, rule)?.unwrap_or_else(|| {
                warn!("Extraction '{}' found nothing at '{}'", rule.name, rule.path);
                Value::Null
            });
            debug!("extracted {} = {}", rule.name, redact(&rule.name, &value));
            match rule.scope {
                ExtractScope::Global => extracted.global.insert(rule.name.clone(), value),
                ExtractScope::Local => extracted.local.insert(rule.name.clone(), value),
            };
        }

        if !extracted.global.is_empty() {
            store.set_many(
                extracted
                    .global
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        }
        Ok(extracted)
    }

    fn resolve(&self, outcome: &ExecutionOutcome, rule: &Extraction) -> Result<Option<Value>> {
        Ok(match rule.kind {
            ExtractionKind::JsonPath => select::json_path(&outcome.body, &rule.path)?,
            ExtractionKind::Regex => {
                select::regex_capture(&outcome.text, &rule.path, rule.group.unwrap_or(1))?
                    .map(Value::String)
            }
            ExtractionKind::Header => outcome
                .header(&rule.path)
                .map(|v| Value::String(v.to_string())),
            ExtractionKind::DbQuery => {
                let db = self
                    .db
                    .as_deref()
                    .ok_or_else(|| Error::Backend("no database configured".to_string()))?;
                select::db_value(db, &rule.path)?
            }
            ExtractionKind::ElementAttribute => {
                let element = outcome.elements.get(&rule.path);
                match rule.attribute.as_deref() {
                    Some(attr) => element
                        .and_then(|e| e.attributes.get(attr).cloned().flatten())
                        .map(Value::String),
                    None => element.and_then(|e| e.text.clone()).map(Value::String),
                }
            }
        })
    }
}
