//! Extraction engine: dispatches one handler per declared strategy.
//!
//! Edge policy: a path that resolves to nothing yields an empty table, never
//! an error — except a genuinely mandatory component with no configured
//! fallback (`headers_data` with neither headers nor a fallback prefix),
//! which raises a table-scoped extraction error.

use indexmap::IndexSet;
use serde_json::{Map, Value};

use crate::document::resolve_path;
use crate::error::{Result, SmelterError};
use crate::profile::{JoinSide, SelectSpec, TableSpec};
use crate::table::{join_tables, ExtractedTable};

/// Dispatches table extraction over the closed strategy union.
pub struct ExtractionEngine;

impl ExtractionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Extract one declared table from a decoded document.
    pub fn extract(&self, spec: &TableSpec, document: &Value) -> Result<ExtractedTable> {
        self.extract_select(&spec.id, &spec.select, document)
    }

    fn extract_select(
        &self,
        table_id: &str,
        select: &SelectSpec,
        document: &Value,
    ) -> Result<ExtractedTable> {
        match select {
            SelectSpec::FlatObject {
                path,
                flatten_nested,
                separator,
            } => self.flat_object(table_id, document, path, *flatten_nested, separator),
            SelectSpec::HeadersData {
                path,
                headers_key,
                data_key,
                header_fallback,
            } => self.headers_data(
                table_id,
                document,
                path,
                headers_key,
                data_key,
                header_fallback.as_deref(),
            ),
            SelectSpec::ArrayOfObjects { path, fields } => {
                Ok(self.array_of_objects(document, path, fields.as_deref()))
            }
            SelectSpec::Unpivot {
                path,
                id_vars,
                value_vars,
                var_name,
                value_name,
            } => Ok(self.unpivot(document, path, id_vars, value_vars, var_name, value_name)),
            SelectSpec::Join { left, right, how } => Ok(self.join(document, left, right, *how)),
            SelectSpec::RepeatOver {
                iterate_path,
                index_var,
                inject_fields,
                base,
            } => self.repeat_over(table_id, document, iterate_path, index_var, inject_fields, base),
        }
    }

    /// The object at `path` becomes exactly one row.
    fn flat_object(
        &self,
        table_id: &str,
        document: &Value,
        path: &str,
        flatten_nested: bool,
        separator: &str,
    ) -> Result<ExtractedTable> {
        let Some(value) = resolve_path(document, path) else {
            return Ok(ExtractedTable::empty());
        };

        let Value::Object(object) = value else {
            return Err(SmelterError::extraction(
                table_id,
                format!("flat_object path '{path}' does not resolve to an object"),
            ));
        };

        let mut columns = Vec::new();
        let mut row = Vec::new();
        if flatten_nested {
            flatten_object(object, "", separator, &mut columns, &mut row);
        } else {
            for (key, cell) in object {
                columns.push(key.clone());
                row.push(cell.clone());
            }
        }

        let mut table = ExtractedTable::new(columns);
        table.push_row(row);
        Ok(table)
    }

    /// Zip a header sequence and a parallel sequence-of-sequences into rows.
    fn headers_data(
        &self,
        table_id: &str,
        document: &Value,
        path: &str,
        headers_key: &str,
        data_key: &str,
        header_fallback: Option<&str>,
    ) -> Result<ExtractedTable> {
        let Some(value) = resolve_path(document, path) else {
            return Ok(ExtractedTable::empty());
        };

        let data: Vec<Vec<Value>> = match resolve_path(value, data_key) {
            Some(Value::Array(rows)) => rows
                .iter()
                .map(|row| match row {
                    Value::Array(cells) => cells.clone(),
                    other => vec![other.clone()],
                })
                .collect(),
            _ => Vec::new(),
        };

        let headers: Option<Vec<String>> = match resolve_path(value, headers_key) {
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .map(|h| match h {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect(),
            ),
            _ => None,
        };

        let columns = match headers {
            Some(headers) => headers,
            None => {
                let Some(prefix) = header_fallback else {
                    return Err(SmelterError::extraction(
                        table_id,
                        format!("'{path}.{headers_key}' is absent and no header fallback is configured"),
                    ));
                };
                let width = data.iter().map(Vec::len).max().unwrap_or(0);
                (0..width).map(|i| format!("{prefix}{i}")).collect()
            }
        };

        let mut table = ExtractedTable::new(columns);
        for row in data {
            table.push_row(row);
        }
        Ok(table)
    }

    /// Each array element becomes one row.
    fn array_of_objects(
        &self,
        document: &Value,
        path: &str,
        fields: Option<&[String]>,
    ) -> ExtractedTable {
        let Some(Value::Array(elements)) = resolve_path(document, path) else {
            return ExtractedTable::empty();
        };

        let columns: Vec<String> = match fields {
            Some(fields) => fields.to_vec(),
            // Column set is the first-seen union of keys across elements.
            None => {
                let mut union = IndexSet::new();
                for element in elements {
                    match element {
                        Value::Object(object) => {
                            for key in object.keys() {
                                union.insert(key.clone());
                            }
                        }
                        _ => {
                            union.insert("value".to_string());
                        }
                    }
                }
                union.into_iter().collect()
            }
        };

        let mut table = ExtractedTable::new(columns);
        for element in elements {
            let row = match element {
                Value::Object(object) => table
                    .columns
                    .iter()
                    .map(|col| object.get(col).cloned().unwrap_or(Value::Null))
                    .collect(),
                other => table
                    .columns
                    .iter()
                    .map(|col| {
                        if col == "value" {
                            other.clone()
                        } else {
                            Value::Null
                        }
                    })
                    .collect(),
            };
            table.push_row(row);
        }
        table
    }

    /// Wide-to-long reshape: one output row per (source row, value_var).
    fn unpivot(
        &self,
        document: &Value,
        path: &str,
        id_vars: &[String],
        value_vars: &[String],
        var_name: &str,
        value_name: &str,
    ) -> ExtractedTable {
        let wide = self.array_of_objects(document, path, None);

        let mut columns: Vec<String> = id_vars.to_vec();
        columns.push(var_name.to_string());
        columns.push(value_name.to_string());
        let mut long = ExtractedTable::new(columns);

        for row in &wide.rows {
            let ids: Vec<Value> = id_vars
                .iter()
                .map(|var| {
                    wide.column_index(var)
                        .and_then(|i| row.get(i).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();

            for var in value_vars {
                let value = wide
                    .column_index(var)
                    .and_then(|i| row.get(i).cloned())
                    .unwrap_or(Value::Null);
                let mut out = ids.clone();
                out.push(Value::String(var.clone()));
                out.push(value);
                long.push_row(out);
            }
        }
        long
    }

    /// Extract both sides as array-of-objects tables, then join on key
    /// equality.
    fn join(
        &self,
        document: &Value,
        left: &JoinSide,
        right: &JoinSide,
        how: crate::profile::JoinKind,
    ) -> ExtractedTable {
        let left_table = self.array_of_objects(document, &left.path, None);
        let right_table = self.array_of_objects(document, &right.path, None);
        join_tables(&left_table, &left.key, &right_table, &right.key, how)
    }

    /// Iterate the array at `iterate_path`, substituting the index into the
    /// wrapped strategy's path template and concatenating iterations with
    /// schema-union semantics.
    fn repeat_over(
        &self,
        table_id: &str,
        document: &Value,
        iterate_path: &str,
        index_var: &str,
        inject_fields: &[String],
        base: &SelectSpec,
    ) -> Result<ExtractedTable> {
        let Some(Value::Array(elements)) = resolve_path(document, iterate_path) else {
            return Ok(ExtractedTable::empty());
        };

        let mut accumulated = ExtractedTable::empty();
        for (index, element) in elements.iter().enumerate() {
            let substituted = base.substitute_index(index_var, index);
            let mut sub_table = self.extract_select(table_id, &substituted, document)?;

            let injected: Vec<(String, Value)> = inject_fields
                .iter()
                .map(|field| {
                    let value = match element {
                        Value::Object(object) => {
                            object.get(field).cloned().unwrap_or(Value::Null)
                        }
                        _ => Value::Null,
                    };
                    (field.clone(), value)
                })
                .collect();
            sub_table.prepend_columns(&injected);

            accumulated.union_concat(sub_table);
        }
        Ok(accumulated)
    }
}

impl Default for ExtractionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursively flatten nested objects into dotted/underscored column names.
/// Arrays and scalars are kept as-is.
fn flatten_object(
    object: &Map<String, Value>,
    prefix: &str,
    separator: &str,
    columns: &mut Vec<String>,
    row: &mut Vec<Value>,
) {
    for (key, value) in object {
        let name = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}{separator}{key}")
        };
        match value {
            Value::Object(nested) => flatten_object(nested, &name, separator, columns, row),
            other => {
                columns.push(name);
                row.push(other.clone());
            }
        }
    }
}
