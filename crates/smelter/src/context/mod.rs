//! Context resolution: the four-layer priority merge of contextual metadata
//! for one source document.
//!
//! Layers fold left-to-right, each overwriting keys it defines:
//! static defaults, then regex rules over descriptor strings, then
//! content-path rules over the parsed document, then caller overrides
//! restricted to the allow-list. Per-field provenance is retained for
//! diagnostics.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::NaiveDate;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::document::{resolve_path, SourceDescriptor};
use crate::error::{Result, SmelterError};
use crate::profile::{
    ContentRule, ContextDefaults, FailurePolicy, RegexRule, RegexScope, ValueTransform,
};

/// Which layer last set a context field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextLayer {
    Defaults,
    RegexPattern,
    ContentPath,
    UserOverride,
}

/// A resolved context: field values plus per-field provenance.
///
/// Never mutated after resolution; a new resolution supersedes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionContext {
    fields: IndexMap<String, Value>,
    provenance: IndexMap<String, ContextLayer>,
}

impl ExtractionContext {
    /// Get a resolved field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Which layer last set the field.
    pub fn provenance(&self, field: &str) -> Option<ContextLayer> {
        self.provenance.get(field).copied()
    }

    /// Iterate resolved fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Number of resolved fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn set(&mut self, field: &str, value: Value, layer: ContextLayer) {
        self.fields.insert(field.to_string(), value);
        self.provenance.insert(field.to_string(), layer);
    }
}

/// Outcome of resolving one document's context.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(ExtractionContext),
    /// A `skip_file` rule fired: the caller excludes this document, and the
    /// partial resolution is discarded entirely.
    Skipped { field: String },
}

/// Cache of compiled patterns, keyed by pattern text.
///
/// Each distinct pattern compiles once per engine, not once per document.
/// `Regex` clones share the compiled program, so cache hits are cheap.
#[derive(Default)]
pub(crate) struct RegexCache {
    compiled: RwLock<HashMap<String, Regex>>,
}

impl RegexCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, pattern: &str) -> Result<Regex> {
        let guard = self
            .compiled
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(regex) = guard.get(pattern) {
            return Ok(regex.clone());
        }
        drop(guard);

        let regex = Regex::new(pattern)?;
        self.compiled
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pattern.to_string(), regex.clone());
        Ok(regex)
    }
}

/// Resolves the four-layer context merge for source documents.
pub struct ContextResolver {
    patterns: RegexCache,
}

impl ContextResolver {
    pub fn new() -> Self {
        Self {
            patterns: RegexCache::new(),
        }
    }

    /// Resolve the context for one document.
    pub fn resolve(
        &self,
        defaults: &ContextDefaults,
        descriptor: &SourceDescriptor,
        content: &Value,
        overrides: &IndexMap<String, Value>,
    ) -> Result<Resolution> {
        let mut context = ExtractionContext::default();

        for (field, value) in &defaults.defaults {
            context.set(field, value.clone(), ContextLayer::Defaults);
        }

        for rule in &defaults.regex_patterns {
            match self.apply_regex_rule(rule, descriptor)? {
                RuleOutcome::Value(value) => {
                    context.set(&rule.field, value, ContextLayer::RegexPattern)
                }
                RuleOutcome::Unset => {}
                RuleOutcome::Skip => {
                    return Ok(Resolution::Skipped {
                        field: rule.field.clone(),
                    });
                }
            }
        }

        for rule in &defaults.content_patterns {
            match self.apply_content_rule(rule, content)? {
                RuleOutcome::Value(value) => {
                    context.set(&rule.field, value, ContextLayer::ContentPath)
                }
                RuleOutcome::Unset => {}
                RuleOutcome::Skip => {
                    return Ok(Resolution::Skipped {
                        field: rule.field.clone(),
                    });
                }
            }
        }

        for (field, value) in overrides {
            let permitted = defaults.allow_user_override.is_empty()
                || defaults.allow_user_override.iter().any(|f| f == field);
            if permitted {
                context.set(field, value.clone(), ContextLayer::UserOverride);
            } else {
                warn!(field, "ignoring override outside allow-list");
            }
        }

        Ok(Resolution::Resolved(context))
    }

    fn apply_regex_rule(
        &self,
        rule: &RegexRule,
        descriptor: &SourceDescriptor,
    ) -> Result<RuleOutcome> {
        let subject = match rule.scope {
            RegexScope::FileName => descriptor.file_name(),
            RegexScope::ParentPath => descriptor.parent_path(),
            RegexScope::FullPath => descriptor.full_path(),
        };

        let regex = self.patterns.get(&rule.pattern)?;

        let captured = regex.captures(&subject).and_then(|caps| {
            caps.name(&rule.field)
                .or_else(|| caps.get(1))
                .map(|m| m.as_str().to_string())
        });

        let Some(raw) = captured else {
            return self.on_missing(
                rule.on_missing,
                &rule.field,
                format!("pattern '{}' did not match '{}'", rule.pattern, subject),
            );
        };

        let value = match &rule.transform {
            Some(transform) => apply_value_transform(transform, &raw, &rule.field)?,
            None => Value::String(raw),
        };
        Ok(RuleOutcome::Value(value))
    }

    fn apply_content_rule(&self, rule: &ContentRule, content: &Value) -> Result<RuleOutcome> {
        if let Some(value) = resolve_path(content, &rule.path) {
            return Ok(RuleOutcome::Value(value.clone()));
        }
        if let Some(default) = &rule.default {
            return Ok(RuleOutcome::Value(default.clone()));
        }
        if !rule.required {
            return Ok(RuleOutcome::Unset);
        }

        self.on_missing(
            rule.on_missing,
            &rule.field,
            format!("path '{}' has no value and no default", rule.path),
        )
    }

    fn on_missing(
        &self,
        policy: FailurePolicy,
        field: &str,
        message: String,
    ) -> Result<RuleOutcome> {
        match policy {
            FailurePolicy::Warn => {
                warn!(field, %message, "context rule produced no value");
                Ok(RuleOutcome::Unset)
            }
            FailurePolicy::Error => Err(SmelterError::Context {
                field: field.to_string(),
                message,
            }),
            FailurePolicy::SkipFile => Ok(RuleOutcome::Skip),
        }
    }
}

impl Default for ContextResolver {
    fn default() -> Self {
        Self::new()
    }
}

enum RuleOutcome {
    Value(Value),
    Unset,
    Skip,
}

/// Apply a declared value transform to a captured string.
fn apply_value_transform(transform: &ValueTransform, raw: &str, field: &str) -> Result<Value> {
    let context_err = |message: String| SmelterError::Context {
        field: field.to_string(),
        message,
    };

    match transform {
        ValueTransform::ParseDate { format } => {
            let date = NaiveDate::parse_from_str(raw, format)
                .map_err(|e| context_err(format!("cannot parse date '{raw}': {e}")))?;
            Ok(Value::String(date.format("%Y-%m-%d").to_string()))
        }
        ValueTransform::ToInt => {
            let n: i64 = raw
                .parse()
                .map_err(|_| context_err(format!("cannot parse integer '{raw}'")))?;
            Ok(Value::from(n))
        }
        ValueTransform::ToFloat => {
            let n: f64 = raw
                .parse()
                .map_err(|_| context_err(format!("cannot parse float '{raw}'")))?;
            Ok(Value::from(n))
        }
        ValueTransform::Lowercase => Ok(Value::String(raw.to_lowercase())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults_from_json(json: &str) -> ContextDefaults {
        serde_json::from_str(json).unwrap()
    }

    fn resolve(
        defaults: &ContextDefaults,
        path: &str,
        content: Value,
        overrides: IndexMap<String, Value>,
    ) -> Result<Resolution> {
        ContextResolver::new().resolve(
            defaults,
            &SourceDescriptor::new(path),
            &content,
            &overrides,
        )
    }

    #[test]
    fn test_regex_cache_stores_one_entry_per_pattern() {
        let cache = RegexCache::new();
        let first = cache.get(r"lot_(\d+)").unwrap();
        let second = cache.get(r"lot_(\d+)").unwrap();

        assert_eq!(first.as_str(), second.as_str());
        assert!(first.is_match("lot_42"));
        assert_eq!(cache.compiled.read().unwrap().len(), 1);
        assert!(matches!(cache.get("("), Err(SmelterError::Regex(_))));
    }

    #[test]
    fn test_layer_priority_order() {
        let defaults = defaults_from_json(
            r#"{
                "defaults": {"site": "default-site", "tool": "etcher"},
                "regex_patterns": [
                    {"field": "site", "pattern": "^(\\w+)_", "scope": "file_name"}
                ],
                "content_patterns": [
                    {"field": "site", "path": "meta.site"}
                ]
            }"#,
        );

        let content = json!({"meta": {"site": "fab-2"}});
        let mut overrides = IndexMap::new();
        overrides.insert("site".to_string(), json!("override-site"));

        let Resolution::Resolved(ctx) =
            resolve(&defaults, "fab1_run.json", content, overrides).unwrap()
        else {
            panic!("expected resolution");
        };

        assert_eq!(ctx.get("site"), Some(&json!("override-site")));
        assert_eq!(ctx.provenance("site"), Some(ContextLayer::UserOverride));
        assert_eq!(ctx.get("tool"), Some(&json!("etcher")));
        assert_eq!(ctx.provenance("tool"), Some(ContextLayer::Defaults));
    }

    #[test]
    fn test_override_outside_allow_list_ignored() {
        let defaults = defaults_from_json(
            r#"{"defaults": {"site": "a"}, "allow_user_override": ["operator"]}"#,
        );
        let mut overrides = IndexMap::new();
        overrides.insert("site".to_string(), json!("hijacked"));
        overrides.insert("operator".to_string(), json!("kim"));

        let Resolution::Resolved(ctx) =
            resolve(&defaults, "x.json", json!({}), overrides).unwrap()
        else {
            panic!("expected resolution");
        };

        assert_eq!(ctx.get("site"), Some(&json!("a")));
        assert_eq!(ctx.get("operator"), Some(&json!("kim")));
    }

    #[test]
    fn test_regex_warn_leaves_field_unset() {
        let defaults = defaults_from_json(
            r#"{"regex_patterns": [
                {"field": "lot", "pattern": "lot_(?<lot>\\d+)", "on_missing": "warn"}
            ]}"#,
        );

        let Resolution::Resolved(ctx) =
            resolve(&defaults, "nomatch.json", json!({}), IndexMap::new()).unwrap()
        else {
            panic!("expected resolution");
        };
        assert_eq!(ctx.get("lot"), None);
    }

    #[test]
    fn test_regex_error_aborts_document() {
        let defaults = defaults_from_json(
            r#"{"regex_patterns": [
                {"field": "lot", "pattern": "lot_(\\d+)", "on_missing": "error"}
            ]}"#,
        );

        let err = resolve(&defaults, "nomatch.json", json!({}), IndexMap::new()).unwrap_err();
        assert!(matches!(err, SmelterError::Context { .. }));
    }

    #[test]
    fn test_skip_file_discards_partial_resolution() {
        let defaults = defaults_from_json(
            r#"{
                "defaults": {"site": "a"},
                "regex_patterns": [
                    {"field": "lot", "pattern": "lot_(\\d+)", "on_missing": "skip_file"}
                ]
            }"#,
        );

        let outcome = resolve(&defaults, "nomatch.json", json!({}), IndexMap::new()).unwrap();
        match outcome {
            Resolution::Skipped { field } => assert_eq!(field, "lot"),
            Resolution::Resolved(_) => panic!("expected skip"),
        }
    }

    #[test]
    fn test_content_rule_default_and_required() {
        let defaults = defaults_from_json(
            r#"{"content_patterns": [
                {"field": "recipe", "path": "meta.recipe", "default": "unknown"},
                {"field": "batch", "path": "meta.batch", "required": true, "on_missing": "error"}
            ]}"#,
        );

        let err = resolve(&defaults, "x.json", json!({}), IndexMap::new()).unwrap_err();
        assert!(matches!(err, SmelterError::Context { .. }));

        let content = json!({"meta": {"batch": 7}});
        let Resolution::Resolved(ctx) =
            resolve(&defaults, "x.json", content, IndexMap::new()).unwrap()
        else {
            panic!("expected resolution");
        };
        assert_eq!(ctx.get("recipe"), Some(&json!("unknown")));
        assert_eq!(ctx.get("batch"), Some(&json!(7)));
    }

    #[test]
    fn test_date_transform() {
        let defaults = defaults_from_json(
            r#"{"regex_patterns": [{
                "field": "run_date",
                "pattern": "_(\\d{8})\\.",
                "transform": {"kind": "parse_date", "format": "%Y%m%d"}
            }]}"#,
        );

        let Resolution::Resolved(ctx) =
            resolve(&defaults, "run_20240115.json", json!({}), IndexMap::new()).unwrap()
        else {
            panic!("expected resolution");
        };
        assert_eq!(ctx.get("run_date"), Some(&json!("2024-01-15")));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let defaults = defaults_from_json(
            r#"{
                "defaults": {"a": 1},
                "regex_patterns": [{"field": "lot", "pattern": "lot_(\\d+)"}]
            }"#,
        );

        let first = resolve(&defaults, "lot_42.json", json!({}), IndexMap::new()).unwrap();
        let second = resolve(&defaults, "lot_42.json", json!({}), IndexMap::new()).unwrap();

        let (Resolution::Resolved(a), Resolution::Resolved(b)) = (first, second) else {
            panic!("expected resolutions");
        };
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
