//! Declarative registration overrides (`*.algometa.yaml`).
//!
//! Grounded on the Python original's `_load_overrides_from_dir` /
//! `_parse_override_entry` / `_apply_overrides`: ops can retune metadata,
//! logging, and execution hints for an already code-registered algorithm
//! without touching its source, keyed by `(name, version, category, kind)`
//! (`registry.py:185,344`) - `category`/`kind` gate whether an override
//! applies at all, they are never themselves rewritten.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::spec::{AlgorithmKind, AlgorithmSpec};

/// Fields an override file is allowed to carry. Anything else is a parse
/// error - overrides retune metadata/observability/execution, they do not
/// smuggle in new entrypoints.
const ALLOWED_KEYS: &[&str] = &[
    "name",
    "version",
    "category",
    "kind",
    "description",
    "created_time",
    "author",
    "application_scenarios",
    "extra",
    "logging",
    "execution",
];

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingOverride {
    pub enabled: Option<bool>,
    pub log_input: Option<bool>,
    pub log_output: Option<bool>,
    pub on_error_only: Option<bool>,
    pub sample_rate: Option<f64>,
    pub max_payload_length: Option<usize>,
    pub redact_fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ExecutionOverride {
    pub stateful: Option<bool>,
    pub isolated_pool: Option<bool>,
    pub max_workers: Option<usize>,
    pub timeout_s: Option<u64>,
    pub gpu: Option<String>,
}

/// One parsed `*.algometa.yaml` document.
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideRecord {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub kind: Option<AlgorithmKind>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_time: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub application_scenarios: Option<String>,
    #[serde(default)]
    pub extra: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub logging: Option<LoggingOverride>,
    #[serde(default)]
    pub execution: Option<ExecutionOverride>,
}

impl OverrideRecord {
    /// `(category, kind)` are part of the match key an override targets
    /// (`spec.md` §4.1), not fields it can rewrite - a record whose
    /// `category`/`kind` don't agree with `spec`'s is scoped to a
    /// different logical entry and must not be applied to this one.
    /// `None` on the record means "any", matching regardless.
    pub fn matches(&self, spec: &AlgorithmSpec) -> bool {
        if let Some(kind) = self.kind {
            if kind != spec.kind {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if Some(category.as_str()) != spec.metadata.category.as_deref() {
                return false;
            }
        }
        true
    }

    /// Applies this override's `Some` fields onto `spec` in place, if
    /// `spec` matches this override's `(category, kind)` scope. Returns
    /// whether the override was applied. `None` fields on a matching
    /// override leave the code-declared default untouched.
    pub fn apply_to(&self, spec: &mut AlgorithmSpec) -> bool {
        if !self.matches(spec) {
            return false;
        }
        if let Some(description) = &self.description {
            spec.metadata.description = Some(description.clone());
        }
        if let Some(created_time) = &self.created_time {
            spec.metadata.created_time = Some(created_time.clone());
        }
        if let Some(author) = &self.author {
            spec.metadata.author = Some(author.clone());
        }
        if let Some(scenarios) = &self.application_scenarios {
            spec.metadata.application_scenarios = Some(scenarios.clone());
        }
        for (k, v) in &self.extra {
            spec.metadata.extra.insert(k.clone(), v.clone());
        }
        if let Some(logging) = &self.logging {
            if let Some(v) = logging.enabled {
                spec.logging.enabled = v;
            }
            if let Some(v) = logging.log_input {
                spec.logging.log_input = v;
            }
            if let Some(v) = logging.log_output {
                spec.logging.log_output = v;
            }
            if let Some(v) = logging.on_error_only {
                spec.logging.on_error_only = v;
            }
            if let Some(v) = logging.sample_rate {
                spec.logging.sample_rate = v;
            }
            if let Some(v) = logging.max_payload_length {
                spec.logging.max_payload_length = v;
            }
            if let Some(v) = &logging.redact_fields {
                spec.logging.redact_fields = v.clone();
            }
        }
        if let Some(execution) = &self.execution {
            if let Some(v) = execution.stateful {
                spec.execution.stateful = v;
            }
            if let Some(v) = execution.isolated_pool {
                spec.execution.isolated_pool = v;
            }
            if execution.max_workers.is_some() {
                spec.execution.max_workers = execution.max_workers;
            }
            if execution.timeout_s.is_some() {
                spec.execution.timeout_s = execution.timeout_s;
            }
            if let Some(v) = &execution.gpu {
                spec.execution.gpu = Some(v.clone());
            }
        }
        true
    }
}

fn parse_override_entry(raw: &str, source: &Path) -> Result<OverrideRecord, String> {
    let value: serde_yaml::Value = serde_yaml::from_str(raw)
        .map_err(|e| format!("{}: invalid YAML: {e}", source.display()))?;
    if let serde_yaml::Value::Mapping(map) = &value {
        for key in map.keys() {
            if let Some(key) = key.as_str() {
                if !ALLOWED_KEYS.contains(&key) {
                    return Err(format!(
                        "{}: unrecognized override key {key:?}, expected one of {ALLOWED_KEYS:?}",
                        source.display()
                    ));
                }
            }
        }
    }
    serde_yaml::from_value(value)
        .map_err(|e| format!("{}: override does not match expected shape: {e}", source.display()))
}

/// Loads every `*.algometa.yaml` file directly inside `dir` (not
/// recursive), in lexical filename order.
pub fn load_overrides_from_dir(dir: &Path) -> Result<Vec<OverrideRecord>, String> {
    let mut paths: Vec<_> = fs::read_dir(dir)
        .map_err(|e| format!("{}: {e}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(".algometa.yaml"))
                .unwrap_or(false)
        })
        .collect();
    paths.sort();

    let mut records = Vec::with_capacity(paths.len());
    for path in paths {
        let raw = fs::read_to_string(&path).map_err(|e| format!("{}: {e}", path.display()))?;
        records.push(parse_override_entry(&raw, &path)?);
    }
    Ok(records)
}
