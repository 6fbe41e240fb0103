//! Validation engine: schema-stability, value, and aggregate checks.
//!
//! Validation findings never abort extraction. They accumulate into a
//! [`ValidationResult`] per table; the caller applies its configured
//! `on_validation_fail` policy.

use serde::{Deserialize, Serialize};

use crate::context::RegexCache;
use crate::profile::{
    AggregateConstraint, AggregateRule, RuleSeverity, StableColumnsMode, TableSpec,
    ValidationSpec, ValueConstraint, ValueRule,
};
use crate::table::{cell_key, cell_to_f64, ExtractedTable};

/// Per-table validation verdict with separated error/warning findings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub table_id: String,
    /// True only if zero error-severity findings were recorded.
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Declared stable columns absent from the actual table.
    pub missing_columns: Vec<String>,
    /// Actual columns outside the declared stable set (empty in subset mode).
    pub extra_columns: Vec<String>,
}

impl ValidationResult {
    fn new(table_id: &str) -> Self {
        Self {
            table_id: table_id.to_string(),
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
            missing_columns: Vec::new(),
            extra_columns: Vec::new(),
        }
    }

    fn record(&mut self, severity: RuleSeverity, message: String) {
        match severity {
            RuleSeverity::Error => {
                self.valid = false;
                self.errors.push(message);
            }
            RuleSeverity::Warn => self.warnings.push(message),
        }
    }
}

/// Runs declared validation rules against extracted tables.
pub struct ValidationEngine {
    patterns: RegexCache,
}

impl ValidationEngine {
    pub fn new() -> Self {
        Self {
            patterns: RegexCache::new(),
        }
    }

    /// Run all rule categories for one table and merge the verdicts.
    pub fn validate(
        &self,
        table: &ExtractedTable,
        spec: &TableSpec,
        rules: &ValidationSpec,
    ) -> ValidationResult {
        let mut result = ValidationResult::new(&spec.id);
        self.validate_stable_columns(table, spec, &mut result);
        self.validate_values(table, &spec.id, &rules.value_rules, &mut result);
        self.validate_aggregate(table, &spec.id, &rules.aggregate_rules, &mut result);
        result
    }

    /// Check the actual column set against the declared stable set.
    ///
    /// `missing = declared - actual`; `extra = actual - declared` unless the
    /// spec is in subset mode. Severity follows the spec's mode.
    pub fn validate_stable_columns(
        &self,
        table: &ExtractedTable,
        spec: &TableSpec,
        result: &mut ValidationResult,
    ) {
        if spec.stable_columns.is_empty() || spec.stable_columns_mode == StableColumnsMode::Ignore
        {
            return;
        }

        result.missing_columns = spec
            .stable_columns
            .iter()
            .filter(|c| !table.columns.contains(c))
            .cloned()
            .collect();

        if !spec.stable_columns_subset {
            result.extra_columns = table
                .columns
                .iter()
                .filter(|c| !spec.stable_columns.contains(c))
                .cloned()
                .collect();
        }

        if result.missing_columns.is_empty() && result.extra_columns.is_empty() {
            return;
        }

        let severity = match spec.stable_columns_mode {
            StableColumnsMode::Error => RuleSeverity::Error,
            _ => RuleSeverity::Warn,
        };
        if !result.missing_columns.is_empty() {
            result.record(
                severity,
                format!("missing declared columns: {:?}", result.missing_columns),
            );
        }
        if !result.extra_columns.is_empty() {
            result.record(
                severity,
                format!("unexpected extra columns: {:?}", result.extra_columns),
            );
        }
    }

    /// Apply per-column value constraints.
    pub fn validate_values(
        &self,
        table: &ExtractedTable,
        table_id: &str,
        rules: &[ValueRule],
        result: &mut ValidationResult,
    ) {
        for rule in rules {
            if rule.table.as_deref().is_some_and(|t| t != table_id) {
                continue;
            }
            let Some(col) = table.column_index(&rule.column) else {
                continue;
            };

            let violations = match &rule.constraint {
                ValueConstraint::Range { min, max } => table
                    .rows
                    .iter()
                    .filter(|row| {
                        cell_to_f64(&row[col]).is_some_and(|v| {
                            min.is_some_and(|m| v < m) || max.is_some_and(|m| v > m)
                        })
                    })
                    .count(),
                ValueConstraint::NotNull => {
                    table.rows.iter().filter(|row| row[col].is_null()).count()
                }
                ValueConstraint::Pattern { regex } => {
                    // Bad patterns were rejected at profile validation, and
                    // the cache compiles each survivor once per engine.
                    let Ok(regex) = self.patterns.get(regex) else {
                        continue;
                    };
                    table
                        .rows
                        .iter()
                        .filter(|row| match &row[col] {
                            serde_json::Value::String(s) => !regex.is_match(s),
                            serde_json::Value::Null => false,
                            other => !regex.is_match(&other.to_string()),
                        })
                        .count()
                }
            };

            if violations > 0 {
                result.record(
                    rule.severity,
                    format!(
                        "column '{}': {} value(s) violate {:?}",
                        rule.column, violations, rule.constraint
                    ),
                );
            }
        }
    }

    /// Apply table-wide aggregate constraints.
    pub fn validate_aggregate(
        &self,
        table: &ExtractedTable,
        table_id: &str,
        rules: &[AggregateRule],
        result: &mut ValidationResult,
    ) {
        for rule in rules {
            if rule.table.as_deref().is_some_and(|t| t != table_id) {
                continue;
            }

            match &rule.constraint {
                AggregateConstraint::MinRows { count } => {
                    if table.row_count() < *count {
                        result.record(
                            rule.severity,
                            format!(
                                "table has {} rows, minimum is {}",
                                table.row_count(),
                                count
                            ),
                        );
                    }
                }
                AggregateConstraint::MinDistinct { column, count } => {
                    let distinct: std::collections::HashSet<String> = table
                        .column_values(column)
                        .filter(|v| !v.is_null())
                        .map(cell_key)
                        .collect();
                    if distinct.len() < *count {
                        result.record(
                            rule.severity,
                            format!(
                                "column '{}' has {} distinct value(s), minimum is {}",
                                column,
                                distinct.len(),
                                count
                            ),
                        );
                    }
                }
            }
        }
    }
}

impl Default for ValidationEngine {
    fn default() -> Self {
        Self::new()
    }
}
