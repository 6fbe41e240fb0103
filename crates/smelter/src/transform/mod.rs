//! Transform pipeline: normalization plus ordered column transforms.

mod expr;

pub use expr::{BinOp, Expr};

use serde_json::Value;
use tracing::warn;

use crate::profile::{
    CasePolicy, ColumnTransform, Normalization, Transformations,
};
use crate::table::{cell_to_f64, ExtractedTable};

/// Applies normalization and declared transforms to extracted tables.
///
/// A bad calculated-column expression omits that column with a recorded
/// warning; it never fails the table.
pub struct TransformPipeline;

impl TransformPipeline {
    pub fn new() -> Self {
        Self
    }

    /// Normalize cell values in place: sentinel replacement, opt-in numeric
    /// coercion, and uniform trim/case policy for textual cells.
    pub fn normalize(&self, table: &mut ExtractedTable, spec: &Normalization) {
        for row in &mut table.rows {
            for cell in row.iter_mut() {
                let Value::String(text) = cell else { continue };

                let trimmed = if spec.trim {
                    text.trim().to_string()
                } else {
                    text.clone()
                };

                if spec
                    .null_sentinels
                    .iter()
                    .any(|s| s.eq_ignore_ascii_case(trimmed.trim()))
                {
                    *cell = Value::Null;
                    continue;
                }

                let cased = match spec.case {
                    Some(CasePolicy::Lower) => trimmed.to_lowercase(),
                    Some(CasePolicy::Upper) => trimmed.to_uppercase(),
                    None => trimmed,
                };
                *cell = Value::String(cased);
            }
        }

        for column in &spec.coerce_numeric {
            let Some(idx) = table.column_index(column) else {
                continue;
            };
            for row in &mut table.rows {
                let cell = &mut row[idx];
                if cell.is_null() || cell.is_number() {
                    continue;
                }
                // Non-convertible values become null, never an error.
                *cell = match cell_to_f64(cell) {
                    Some(n) => Value::from(n),
                    None => Value::Null,
                };
            }
        }
    }

    /// Apply an ordered sequence of per-table column transforms.
    ///
    /// Returns warnings for columns that were omitted.
    pub fn apply_column_transforms(
        &self,
        table: &mut ExtractedTable,
        transforms: &[ColumnTransform],
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        for transform in transforms {
            match transform {
                ColumnTransform::Rename { from, to } => {
                    if !table.rename_column(from, to) {
                        warnings.push(format!("rename: column '{from}' not found"));
                    }
                }
                ColumnTransform::UnitConvert {
                    column,
                    factor,
                    rename,
                } => {
                    let Some(idx) = table.column_index(column) else {
                        warnings.push(format!("unit_convert: column '{column}' not found"));
                        continue;
                    };
                    for row in &mut table.rows {
                        row[idx] = match cell_to_f64(&row[idx]) {
                            Some(n) => Value::from(n * factor),
                            None => Value::Null,
                        };
                    }
                    if let Some(to) = rename {
                        table.rename_column(column, to);
                    }
                }
                ColumnTransform::Calculated { column, expr } => {
                    if let Err(message) = self.add_calculated(table, column, expr) {
                        warn!(column, %message, "omitting calculated column");
                        warnings.push(format!("calculated '{column}': {message}"));
                    }
                }
            }
        }
        warnings
    }

    /// Apply profile-level transformations: global renames, calculated
    /// columns, and row filters.
    pub fn apply_transformations(
        &self,
        table_id: &str,
        table: &mut ExtractedTable,
        spec: &Transformations,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        for (from, to) in &spec.renames {
            table.rename_column(from, to);
        }

        for calc in &spec.calculated {
            if calc.table.as_deref().is_some_and(|t| t != table_id) {
                continue;
            }
            if let Err(message) = self.add_calculated(table, &calc.column, &calc.expr) {
                warn!(column = %calc.column, %message, "omitting calculated column");
                warnings.push(format!("calculated '{}': {message}", calc.column));
            }
        }

        for filter in &spec.filters {
            if filter.table.as_deref().is_some_and(|t| t != table_id) {
                continue;
            }
            let parsed = match Expr::parse(&filter.expr) {
                Ok(parsed) => parsed,
                Err(message) => {
                    warnings.push(format!("filter '{}': {message}", filter.expr));
                    continue;
                }
            };
            let columns = table.columns.clone();
            table.rows.retain(|row| {
                let lookup = |name: &str| -> Value {
                    columns
                        .iter()
                        .position(|c| c == name)
                        .and_then(|i| row.get(i).cloned())
                        .unwrap_or(Value::Null)
                };
                is_truthy(&parsed.eval(&lookup))
            });
        }

        warnings
    }

    fn add_calculated(
        &self,
        table: &mut ExtractedTable,
        column: &str,
        expr: &str,
    ) -> Result<(), String> {
        let parsed = Expr::parse(expr)?;
        // Referencing a column the table lacks is a bad expression, caught
        // before any row is evaluated.
        if let Some(missing) = parsed
            .columns()
            .into_iter()
            .find(|name| table.column_index(name).is_none())
        {
            return Err(format!("unknown column '{missing}'"));
        }

        let values: Vec<Value> = table
            .rows
            .iter()
            .map(|row| {
                let lookup = |name: &str| -> Value {
                    table
                        .column_index(name)
                        .and_then(|i| row.get(i).cloned())
                        .unwrap_or(Value::Null)
                };
                parsed.eval(&lookup)
            })
            .collect();

        table.add_column(column, values);
        Ok(())
    }
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Row-filter truthiness: boolean true, or a nonzero number.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline() -> TransformPipeline {
        TransformPipeline::new()
    }

    fn sample_table() -> ExtractedTable {
        let mut table = ExtractedTable::new(vec!["id".into(), "cd_nm".into()]);
        table.push_row(vec![json!("a"), json!(45.0)]);
        table.push_row(vec![json!("b"), json!(50.0)]);
        table
    }

    #[test]
    fn test_normalize_sentinels_and_trim() {
        let mut table = ExtractedTable::new(vec!["v".into()]);
        table.push_row(vec![json!("  N/A ")]);
        table.push_row(vec![json!(" ok ")]);

        let spec: Normalization = serde_json::from_value(json!({
            "null_sentinels": ["n/a"],
            "trim": true
        }))
        .unwrap();
        pipeline().normalize(&mut table, &spec);

        assert_eq!(table.rows[0][0], Value::Null);
        assert_eq!(table.rows[1][0], json!("ok"));
    }

    #[test]
    fn test_normalize_numeric_coercion() {
        let mut table = ExtractedTable::new(vec!["cd".into()]);
        table.push_row(vec![json!("45.5")]);
        table.push_row(vec![json!("bad")]);
        table.push_row(vec![Value::Null]);

        let spec: Normalization =
            serde_json::from_value(json!({"coerce_numeric": ["cd"]})).unwrap();
        pipeline().normalize(&mut table, &spec);

        assert_eq!(table.rows[0][0], json!(45.5));
        assert_eq!(table.rows[1][0], Value::Null);
        assert_eq!(table.rows[2][0], Value::Null);
    }

    #[test]
    fn test_rename_and_unit_convert() {
        let mut table = sample_table();
        let transforms: Vec<ColumnTransform> = serde_json::from_value(json!([
            {"op": "rename", "from": "id", "to": "site_id"},
            {"op": "unit_convert", "column": "cd_nm", "factor": 0.5, "rename": "cd_half"}
        ]))
        .unwrap();

        let warnings = pipeline().apply_column_transforms(&mut table, &transforms);
        assert!(warnings.is_empty());
        assert_eq!(table.columns, vec!["site_id", "cd_half"]);
        assert_eq!(table.rows[0][1], json!(22.5));
    }

    #[test]
    fn test_calculated_column() {
        let mut table = sample_table();
        let transforms: Vec<ColumnTransform> = serde_json::from_value(json!([
            {"op": "calculated", "column": "cd_ratio", "expr": "cd_nm / 50"}
        ]))
        .unwrap();

        pipeline().apply_column_transforms(&mut table, &transforms);
        assert_eq!(table.columns, vec!["id", "cd_nm", "cd_ratio"]);
        assert_eq!(table.rows[0][2], json!(0.9));
        assert_eq!(table.rows[1][2], json!(1.0));
    }

    #[test]
    fn test_bad_expression_omits_column_with_warning() {
        let mut table = sample_table();
        let transforms: Vec<ColumnTransform> = serde_json::from_value(json!([
            {"op": "calculated", "column": "broken", "expr": "cd_nm +"}
        ]))
        .unwrap();

        let warnings = pipeline().apply_column_transforms(&mut table, &transforms);
        assert_eq!(warnings.len(), 1);
        assert_eq!(table.columns, vec!["id", "cd_nm"]);
    }

    #[test]
    fn test_calculated_with_unknown_column_omitted() {
        let mut table = sample_table();
        let transforms: Vec<ColumnTransform> = serde_json::from_value(json!([
            {"op": "calculated", "column": "ratio", "expr": "cd_nm / target"}
        ]))
        .unwrap();

        let warnings = pipeline().apply_column_transforms(&mut table, &transforms);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("unknown column 'target'"));
        assert_eq!(table.columns, vec!["id", "cd_nm"]);
    }

    #[test]
    fn test_row_filters() {
        let mut table = sample_table();
        let spec: Transformations = serde_json::from_value(json!({
            "filters": [{"expr": "cd_nm < 50"}]
        }))
        .unwrap();

        pipeline().apply_transformations("t", &mut table, &spec);
        assert_eq!(table.row_count(), 1);
        assert_eq!(table.rows[0][0], json!("a"));
    }

    #[test]
    fn test_global_renames() {
        let mut table = sample_table();
        let spec: Transformations = serde_json::from_value(json!({
            "renames": {"cd_nm": "critical_dimension"}
        }))
        .unwrap();

        pipeline().apply_transformations("t", &mut table, &spec);
        assert_eq!(table.columns[1], "critical_dimension");
    }
}
