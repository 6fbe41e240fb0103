//! Output builder: assembles final deliverables from extracted tables.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::{Result, SmelterError};
use crate::profile::{Measure, OutputSpec, Reduction};
use crate::table::{cell_key, cell_to_f64, join_tables, ExtractedTable};

/// Builds declared deliverables by concatenation, aggregation, or join.
pub struct OutputBuilder;

impl OutputBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build one deliverable from the run's table mapping.
    pub fn build(
        &self,
        spec: &OutputSpec,
        tables: &IndexMap<String, ExtractedTable>,
    ) -> Result<ExtractedTable> {
        match spec {
            OutputSpec::Concat { sources, .. } => {
                let mut result = ExtractedTable::empty();
                for source in sources {
                    let table = lookup(tables, source, spec.name())?;
                    result.union_concat(table.clone());
                }
                Ok(result)
            }
            OutputSpec::Aggregate {
                source,
                group_by,
                measures,
                ..
            } => {
                let table = lookup(tables, source, spec.name())?;
                Ok(self.aggregate(table, group_by, measures))
            }
            OutputSpec::Join {
                left,
                right,
                key,
                how,
                ..
            } => {
                let left = lookup(tables, left, spec.name())?;
                let right = lookup(tables, right, spec.name())?;
                Ok(join_tables(left, key, right, key, *how))
            }
        }
    }

    /// Group rows by key columns and apply one reduction per measure,
    /// emitting one row per distinct group in first-seen order.
    fn aggregate(
        &self,
        table: &ExtractedTable,
        group_by: &[String],
        measures: &[Measure],
    ) -> ExtractedTable {
        let key_indices: Vec<Option<usize>> =
            group_by.iter().map(|c| table.column_index(c)).collect();

        let mut groups: IndexMap<String, Vec<&Vec<Value>>> = IndexMap::new();
        for row in &table.rows {
            let key = key_indices
                .iter()
                .map(|idx| {
                    idx.and_then(|i| row.get(i))
                        .map(cell_key)
                        .unwrap_or_else(|| "null".to_string())
                })
                .collect::<Vec<_>>()
                .join("\u{1f}");
            groups.entry(key).or_default().push(row);
        }

        let mut columns: Vec<String> = group_by.to_vec();
        for measure in measures {
            columns.push(
                measure
                    .rename
                    .clone()
                    .unwrap_or_else(|| measure.column.clone()),
            );
        }
        let mut result = ExtractedTable::new(columns);

        for rows in groups.values() {
            let first = rows[0];
            let mut out: Vec<Value> = key_indices
                .iter()
                .map(|idx| {
                    idx.and_then(|i| first.get(i).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();

            for measure in measures {
                let idx = table.column_index(&measure.column);
                let cells = rows
                    .iter()
                    .filter_map(|row| idx.and_then(|i| row.get(i)))
                    .filter(|v| !v.is_null());
                out.push(reduce(measure.reduce, cells));
            }
            result.push_row(out);
        }
        result
    }
}

impl Default for OutputBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn lookup<'a>(
    tables: &'a IndexMap<String, ExtractedTable>,
    source: &str,
    output: &str,
) -> Result<&'a ExtractedTable> {
    tables.get(source).ok_or_else(|| {
        SmelterError::Configuration(format!(
            "output '{output}' references unknown table '{source}'"
        ))
    })
}

/// Apply a named reduction over the non-null cells of one group.
fn reduce<'a>(reduction: Reduction, cells: impl Iterator<Item = &'a Value>) -> Value {
    match reduction {
        Reduction::Count => Value::from(cells.count()),
        Reduction::First => cells.into_iter().next().cloned().unwrap_or(Value::Null),
        Reduction::Sum | Reduction::Mean | Reduction::Min | Reduction::Max => {
            let numbers: Vec<f64> = cells.filter_map(cell_to_f64).collect();
            if numbers.is_empty() {
                return Value::Null;
            }
            let value = match reduction {
                Reduction::Sum => numbers.iter().sum::<f64>(),
                Reduction::Mean => numbers.iter().sum::<f64>() / numbers.len() as f64,
                Reduction::Min => numbers.iter().cloned().fold(f64::INFINITY, f64::min),
                Reduction::Max => numbers.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                _ => unreachable!(),
            };
            Value::from(value)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tables() -> IndexMap<String, ExtractedTable> {
        let mut sites = ExtractedTable::new(vec!["wafer".into(), "cd".into()]);
        sites.push_row(vec![json!("w1"), json!(40.0)]);
        sites.push_row(vec![json!("w1"), json!(50.0)]);
        sites.push_row(vec![json!("w2"), json!(60.0)]);

        let mut wafers = ExtractedTable::new(vec!["wafer".into(), "slot".into()]);
        wafers.push_row(vec![json!("w1"), json!(1)]);
        wafers.push_row(vec![json!("w2"), json!(2)]);

        let mut map = IndexMap::new();
        map.insert("sites".to_string(), sites);
        map.insert("wafers".to_string(), wafers);
        map
    }

    fn output(json: serde_json::Value) -> OutputSpec {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_concat_diagonal() {
        let mut map = tables();
        let mut extra = ExtractedTable::new(vec!["wafer".into(), "note".into()]);
        extra.push_row(vec![json!("w3"), json!("rework")]);
        map.insert("notes".to_string(), extra);

        let spec = output(json!({
            "kind": "concat",
            "name": "all",
            "sources": ["sites", "notes"]
        }));
        let result = OutputBuilder::new().build(&spec, &map).unwrap();

        assert_eq!(result.columns, vec!["wafer", "cd", "note"]);
        assert_eq!(result.row_count(), 4);
        assert_eq!(result.rows[3][2], json!("rework"));
    }

    #[test]
    fn test_aggregate_first_seen_group_order() {
        let spec = output(json!({
            "kind": "aggregate",
            "name": "by_wafer",
            "source": "sites",
            "group_by": ["wafer"],
            "measures": [
                {"column": "cd", "reduce": "mean", "rename": "cd_mean"},
                {"column": "cd", "reduce": "count", "rename": "n"}
            ]
        }));
        let result = OutputBuilder::new().build(&spec, &tables()).unwrap();

        assert_eq!(result.columns, vec!["wafer", "cd_mean", "n"]);
        assert_eq!(result.rows[0], vec![json!("w1"), json!(45.0), json!(2)]);
        assert_eq!(result.rows[1], vec![json!("w2"), json!(60.0), json!(1)]);
    }

    #[test]
    fn test_join_output() {
        let spec = output(json!({
            "kind": "join",
            "name": "joined",
            "left": "sites",
            "right": "wafers",
            "key": "wafer",
            "how": "left"
        }));
        let result = OutputBuilder::new().build(&spec, &tables()).unwrap();

        assert_eq!(result.columns, vec!["wafer", "cd", "slot"]);
        assert_eq!(result.row_count(), 3);
        assert_eq!(result.rows[0][2], json!(1));
    }

    #[test]
    fn test_unknown_source_is_configuration_error() {
        let spec = output(json!({
            "kind": "concat",
            "name": "bad",
            "sources": ["nope"]
        }));
        let err = OutputBuilder::new().build(&spec, &tables()).unwrap_err();
        assert!(matches!(err, SmelterError::Configuration(_)));
    }

    #[test]
    fn test_min_max_sum_reductions() {
        let spec = output(json!({
            "kind": "aggregate",
            "name": "stats",
            "source": "sites",
            "group_by": [],
            "measures": [
                {"column": "cd", "reduce": "min", "rename": "lo"},
                {"column": "cd", "reduce": "max", "rename": "hi"},
                {"column": "cd", "reduce": "sum", "rename": "total"}
            ]
        }));
        let result = OutputBuilder::new().build(&spec, &tables()).unwrap();
        assert_eq!(result.rows[0], vec![json!(40.0), json!(60.0), json!(150.0)]);
    }
}
