//! Profile model: the validated, versioned, declarative specification that
//! drives a run.
//!
//! Profiles are deserialized with serde; unknown fields are ignored so newer
//! profile documents load on older engines. A profile is immutable once
//! loaded; [`ExtractionProfile::validate`] must pass before extraction
//! begins.

mod select;
mod store;

pub use select::{JoinKind, JoinSide, SelectSpec};
pub use store::{FileProfileStore, ProfileStore};

use std::collections::HashSet;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SmelterError};

/// Template variable reference inside a path, e.g. `{i}`.
static TEMPLATE_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Failure policy when a context rule does not produce a value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Log and leave the field unset.
    #[default]
    Warn,
    /// Abort this document's resolution with a structured error.
    Error,
    /// Exclude this document from processing entirely.
    SkipFile,
}

/// Which descriptor string a regex rule matches against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegexScope {
    /// File name without directories.
    #[default]
    FileName,
    /// Parent directory path.
    ParentPath,
    /// Full relative path.
    FullPath,
}

/// Value transform applied to a captured context value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueTransform {
    /// Parse with a chrono format string, emit ISO-8601 date.
    ParseDate { format: String },
    ToInt,
    ToFloat,
    Lowercase,
}

/// A regex-based context extraction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegexRule {
    /// Context field the capture populates.
    pub field: String,
    /// Pattern with either a named capture matching `field` or group 1.
    pub pattern: String,
    #[serde(default)]
    pub scope: RegexScope,
    #[serde(default)]
    pub transform: Option<ValueTransform>,
    #[serde(default)]
    pub on_missing: FailurePolicy,
}

/// A content-path context extraction rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentRule {
    /// Context field the value populates.
    pub field: String,
    /// Path expression evaluated against the parsed document.
    pub path: String,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub on_missing: FailurePolicy,
}

/// Contextual metadata configuration: static defaults plus ordered
/// extraction rules and the user-override allow-list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextDefaults {
    #[serde(default)]
    pub defaults: IndexMap<String, Value>,
    #[serde(default)]
    pub regex_patterns: Vec<RegexRule>,
    #[serde(default)]
    pub content_patterns: Vec<ContentRule>,
    /// Fields a caller may override. Empty list permits all.
    #[serde(default)]
    pub allow_user_override: Vec<String>,
}

/// Severity attached to declared stable columns drifting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StableColumnsMode {
    /// Schema drift always passes.
    Ignore,
    /// Findings recorded, result stays valid.
    #[default]
    Warn,
    /// Findings mark the result invalid.
    Error,
}

/// An ordered per-table column transform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ColumnTransform {
    /// Pure relabel.
    Rename { from: String, to: String },
    /// Multiply by a factor and optionally relabel.
    UnitConvert {
        column: String,
        factor: f64,
        #[serde(default)]
        rename: Option<String>,
    },
    /// Populate a new column from a restricted arithmetic expression over
    /// existing columns.
    Calculated { column: String, expr: String },
}

/// One declared extraction target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Unique id within the profile.
    pub id: String,
    /// Strategy tag plus strategy-specific configuration.
    pub select: SelectSpec,
    /// Declared expected column set, used to detect schema drift.
    #[serde(default)]
    pub stable_columns: Vec<String>,
    #[serde(default)]
    pub stable_columns_mode: StableColumnsMode,
    /// Subset mode: extra actual columns are not drift.
    #[serde(default)]
    pub stable_columns_subset: bool,
    #[serde(default)]
    pub column_transforms: Vec<ColumnTransform>,
    /// A failed mandatory table aborts the whole run.
    #[serde(default)]
    pub mandatory: bool,
}

/// A group of tables extracted together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Level {
    pub name: String,
    #[serde(default)]
    pub tables: Vec<TableSpec>,
}

/// Profile-level transformations applied after per-table transforms.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transformations {
    /// Global column renames, applied to every table.
    #[serde(default)]
    pub renames: IndexMap<String, String>,
    #[serde(default)]
    pub calculated: Vec<CalculatedColumn>,
    #[serde(default)]
    pub filters: Vec<RowFilter>,
}

/// A profile-level calculated column, optionally scoped to one table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalculatedColumn {
    #[serde(default)]
    pub table: Option<String>,
    pub column: String,
    pub expr: String,
}

/// A row filter: rows are kept where the expression is truthy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowFilter {
    #[serde(default)]
    pub table: Option<String>,
    pub expr: String,
}

/// Text case policy for normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CasePolicy {
    Lower,
    Upper,
}

/// Normalization section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Normalization {
    /// Sentinel strings replaced with null (case-insensitive).
    #[serde(default)]
    pub null_sentinels: Vec<String>,
    /// Columns coerced to numeric; non-convertible values become null.
    #[serde(default)]
    pub coerce_numeric: Vec<String>,
    #[serde(default)]
    pub trim: bool,
    #[serde(default)]
    pub case: Option<CasePolicy>,
}

/// Severity for value and aggregate rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSeverity {
    Warn,
    #[default]
    Error,
}

/// Per-column value constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueConstraint {
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    NotNull,
    Pattern { regex: String },
}

/// A per-column validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValueRule {
    /// Restrict the rule to one table; absent applies everywhere the column
    /// exists.
    #[serde(default)]
    pub table: Option<String>,
    pub column: String,
    pub constraint: ValueConstraint,
    #[serde(default)]
    pub severity: RuleSeverity,
}

/// Table-wide constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AggregateConstraint {
    MinRows { count: usize },
    MinDistinct { column: String, count: usize },
}

/// A table-wide validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateRule {
    #[serde(default)]
    pub table: Option<String>,
    pub constraint: AggregateConstraint,
    #[serde(default)]
    pub severity: RuleSeverity,
}

/// Caller policy applied when a table fails validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailAction {
    #[default]
    Continue,
    Stop,
    Quarantine,
}

/// Validation section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default)]
    pub on_validation_fail: FailAction,
    #[serde(default)]
    pub value_rules: Vec<ValueRule>,
    #[serde(default)]
    pub aggregate_rules: Vec<AggregateRule>,
}

/// A named reduction over a measure column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    Mean,
    Sum,
    Count,
    Min,
    Max,
    First,
}

/// One measure column of an aggregation output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Measure {
    pub column: String,
    pub reduce: Reduction,
    /// Output column name; defaults to the measure column name.
    #[serde(default)]
    pub rename: Option<String>,
}

/// A final deliverable definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputSpec {
    /// Schema-union concatenation of named tables, in input order.
    Concat { name: String, sources: Vec<String> },
    /// Group-and-reduce over one table.
    Aggregate {
        name: String,
        source: String,
        group_by: Vec<String>,
        measures: Vec<Measure>,
    },
    /// Relational join of two named tables.
    Join {
        name: String,
        left: String,
        right: String,
        key: String,
        how: JoinKind,
    },
}

impl OutputSpec {
    /// The deliverable's name.
    pub fn name(&self) -> &str {
        match self {
            OutputSpec::Concat { name, .. }
            | OutputSpec::Aggregate { name, .. }
            | OutputSpec::Join { name, .. } => name,
        }
    }
}

fn default_worker_limit() -> usize {
    1
}

/// Numeric caps checked before extraction begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default = "Limits::default_max_files")]
    pub max_files: usize,
    #[serde(default = "Limits::default_max_tables")]
    pub max_tables: usize,
    #[serde(default = "Limits::default_max_columns")]
    pub max_columns: usize,
    #[serde(default = "Limits::default_max_predicates")]
    pub max_predicates: usize,
    #[serde(default = "Limits::default_max_path_depth")]
    pub max_path_depth: usize,
    #[serde(default = "Limits::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Concurrent document workers within one stage body.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
}

impl Limits {
    fn default_max_files() -> usize {
        1_000
    }
    fn default_max_tables() -> usize {
        100
    }
    fn default_max_columns() -> usize {
        500
    }
    fn default_max_predicates() -> usize {
        200
    }
    fn default_max_path_depth() -> usize {
        16
    }
    fn default_timeout_secs() -> u64 {
        300
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_files: Self::default_max_files(),
            max_tables: Self::default_max_tables(),
            max_columns: Self::default_max_columns(),
            max_predicates: Self::default_max_predicates(),
            max_path_depth: Self::default_max_path_depth(),
            timeout_secs: Self::default_timeout_secs(),
            worker_limit: default_worker_limit(),
        }
    }
}

/// Current profile schema version accepted by this engine.
pub const PROFILE_SCHEMA_VERSION: &str = "1";

/// The root declarative specification for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionProfile {
    /// Schema version tag. Newer minor revisions still load; unknown fields
    /// are ignored throughout.
    pub schema_version: String,
    pub name: String,
    #[serde(default)]
    pub context_defaults: ContextDefaults,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub transformations: Transformations,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub validation: ValidationSpec,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    #[serde(default)]
    pub limits: Limits,
}

impl ExtractionProfile {
    /// Parse a profile from JSON text without validating it.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Look up a level by name.
    pub fn level(&self, name: &str) -> Option<&Level> {
        self.levels.iter().find(|l| l.name == name)
    }

    /// All table specs across levels, in declaration order.
    pub fn all_tables(&self) -> impl Iterator<Item = &TableSpec> {
        self.levels.iter().flat_map(|l| l.tables.iter())
    }

    /// Validate the profile. All violations are configuration errors raised
    /// before any extraction starts.
    pub fn validate(&self) -> Result<()> {
        if self.schema_version.split('.').next() != Some(PROFILE_SCHEMA_VERSION) {
            return Err(SmelterError::Configuration(format!(
                "unsupported profile schema version '{}'",
                self.schema_version
            )));
        }

        let mut seen = HashSet::new();
        for table in self.all_tables() {
            if !seen.insert(table.id.as_str()) {
                return Err(SmelterError::Configuration(format!(
                    "duplicate table id '{}'",
                    table.id
                )));
            }
            validate_select(&table.id, &table.select, false)?;
        }

        for rule in &self.context_defaults.regex_patterns {
            Regex::new(&rule.pattern)?;
        }
        for rule in &self.validation.value_rules {
            if let ValueConstraint::Pattern { regex } = &rule.constraint {
                Regex::new(regex)?;
            }
        }

        self.check_limits(seen.len())
    }

    fn check_limits(&self, table_count: usize) -> Result<()> {
        let limits = &self.limits;

        if table_count > limits.max_tables {
            return Err(SmelterError::Configuration(format!(
                "profile declares {} tables, limit is {}",
                table_count, limits.max_tables
            )));
        }

        for table in self.all_tables() {
            if table.stable_columns.len() > limits.max_columns {
                return Err(SmelterError::Configuration(format!(
                    "table '{}' declares {} stable columns, limit is {}",
                    table.id,
                    table.stable_columns.len(),
                    limits.max_columns
                )));
            }
            for path in table.select.paths() {
                let depth = path.split('.').count();
                if depth > limits.max_path_depth {
                    return Err(SmelterError::Configuration(format!(
                        "path '{}' in table '{}' exceeds depth limit {}",
                        path, table.id, limits.max_path_depth
                    )));
                }
            }
        }

        let predicates = self.validation.value_rules.len()
            + self.validation.aggregate_rules.len()
            + self.transformations.filters.len();
        if predicates > limits.max_predicates {
            return Err(SmelterError::Configuration(format!(
                "profile declares {} predicates, limit is {}",
                predicates, limits.max_predicates
            )));
        }

        Ok(())
    }
}

/// Check strategy composition rules.
///
/// `repeat_over` may wrap any base strategy except another `repeat_over`,
/// and the base must actually reference the index variable.
fn validate_select(table_id: &str, select: &SelectSpec, inside_repeat: bool) -> Result<()> {
    if let SelectSpec::RepeatOver {
        index_var, base, ..
    } = select
    {
        if inside_repeat {
            return Err(SmelterError::Configuration(format!(
                "table '{table_id}': repeat_over may not wrap another repeat_over"
            )));
        }
        let referenced = base.paths().iter().any(|path| {
            TEMPLATE_VAR
                .captures_iter(path)
                .any(|c| &c[1] == index_var.as_str())
        });
        if !referenced {
            return Err(SmelterError::Configuration(format!(
                "table '{table_id}': repeat_over base never references '{{{index_var}}}'"
            )));
        }
        validate_select(table_id, base, true)?;
    }
    Ok(())
}
