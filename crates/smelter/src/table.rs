//! Extracted table representation.

use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An extracted table: an ordered column sequence plus ordered rows.
///
/// Rows are homogeneous with the column sequence; a missing cell is an
/// explicit `Value::Null`, never an omitted entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedTable {
    /// Column names, in extraction order.
    pub columns: Vec<String>,
    /// Row data, row-major. Every row has exactly `columns.len()` cells.
    pub rows: Vec<Vec<Value>>,
}

impl ExtractedTable {
    /// Create a table with the given columns and no rows.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Create an empty table (no columns, no rows).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of columns.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Number of rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Find the index of a column by name.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Get a specific cell value.
    pub fn get(&self, row: usize, col: usize) -> Option<&Value> {
        self.rows.get(row).and_then(|r| r.get(col))
    }

    /// Push a row, padding with nulls or truncating to the column count.
    pub fn push_row(&mut self, mut row: Vec<Value>) {
        row.resize(self.columns.len(), Value::Null);
        self.rows.push(row);
    }

    /// Rename a column in place. Returns false if the column is absent.
    pub fn rename_column(&mut self, from: &str, to: &str) -> bool {
        match self.column_index(from) {
            Some(idx) => {
                self.columns[idx] = to.to_string();
                true
            }
            None => false,
        }
    }

    /// Append a new column with the given per-row values (padded with nulls).
    pub fn add_column(&mut self, name: impl Into<String>, mut values: Vec<Value>) {
        values.resize(self.rows.len(), Value::Null);
        self.columns.push(name.into());
        for (row, value) in self.rows.iter_mut().zip(values) {
            row.push(value);
        }
    }

    /// Prepend columns with constant values to every row.
    ///
    /// Used by `repeat_over` to inject per-iteration fields.
    pub fn prepend_columns(&mut self, fields: &[(String, Value)]) {
        for (name, value) in fields.iter().rev() {
            self.columns.insert(0, name.clone());
            for row in &mut self.rows {
                row.insert(0, value.clone());
            }
        }
    }

    /// Project the table down to exactly the given columns.
    ///
    /// Columns absent from the table produce null cells.
    pub fn project(&self, columns: &[String]) -> Self {
        let indices: Vec<Option<usize>> = columns.iter().map(|c| self.column_index(c)).collect();
        let rows = self
            .rows
            .iter()
            .map(|row| {
                indices
                    .iter()
                    .map(|idx| idx.and_then(|i| row.get(i).cloned()).unwrap_or(Value::Null))
                    .collect()
            })
            .collect();
        Self {
            columns: columns.to_vec(),
            rows,
        }
    }

    /// Concatenate another table into this one with schema-union (diagonal)
    /// semantics.
    ///
    /// The merged column set is the first-seen union; a column absent from
    /// either source yields null cells for that source's rows. Input row
    /// order is preserved.
    pub fn union_concat(&mut self, other: ExtractedTable) {
        if self.columns.is_empty() && self.rows.is_empty() {
            *self = other;
            return;
        }

        let mut union: IndexSet<String> = self.columns.iter().cloned().collect();
        for col in &other.columns {
            union.insert(col.clone());
        }
        let union: Vec<String> = union.into_iter().collect();

        if union != self.columns {
            let realigned = self.project(&union);
            self.columns = realigned.columns;
            self.rows = realigned.rows;
        }

        let other = other.project(&self.columns);
        self.rows.extend(other.rows);
    }

    /// Iterate the values of a named column.
    pub fn column_values<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Value> {
        let idx = self.column_index(name);
        self.rows
            .iter()
            .filter_map(move |row| idx.and_then(|i| row.get(i)))
    }
}

/// Interpret a cell as a number, accepting numeric strings.
pub fn cell_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Build a grouping/join key from a cell value.
///
/// Stable across runs: objects serialize with ordered keys via the
/// canonical form used for artifact identifiers.
pub fn cell_key(value: &Value) -> String {
    crate::stage::canonical_json(value)
}

/// Relational join on key equality.
///
/// Output columns are the left columns followed by right columns not already
/// present on the left. `Left`/`Right` preserve all rows of the named side
/// with nulls for unmatched opposite-side columns; `Inner` drops unmatched
/// rows on both sides; `Outer` is the key-wise union.
pub fn join_tables(
    left: &ExtractedTable,
    left_key: &str,
    right: &ExtractedTable,
    right_key: &str,
    how: crate::profile::JoinKind,
) -> ExtractedTable {
    use crate::profile::JoinKind;

    if how == JoinKind::Right {
        return join_tables(right, right_key, left, left_key, JoinKind::Left);
    }

    let mut columns = left.columns.clone();
    let right_extra: Vec<String> = right
        .columns
        .iter()
        .filter(|c| !left.columns.contains(c))
        .cloned()
        .collect();
    columns.extend(right_extra.iter().cloned());

    let mut result = ExtractedTable::new(columns);

    let left_key_idx = left.column_index(left_key);
    let right_key_idx = right.column_index(right_key);

    // Right-side rows indexed by key, preserving row order within a key.
    let mut right_index: indexmap::IndexMap<String, Vec<usize>> = indexmap::IndexMap::new();
    if let Some(rk) = right_key_idx {
        for (idx, row) in right.rows.iter().enumerate() {
            if let Some(key) = row.get(rk) {
                if !key.is_null() {
                    right_index.entry(cell_key(key)).or_default().push(idx);
                }
            }
        }
    }

    let mut matched_right: Vec<bool> = vec![false; right.row_count()];

    for left_row in &left.rows {
        let matches = left_key_idx
            .and_then(|lk| left_row.get(lk))
            .filter(|key| !key.is_null())
            .and_then(|key| right_index.get(&cell_key(key)));

        match matches {
            Some(indices) => {
                for &right_idx in indices {
                    matched_right[right_idx] = true;
                    let mut row = left_row.clone();
                    let right_row = &right.rows[right_idx];
                    for col in &right_extra {
                        let value = right
                            .column_index(col)
                            .and_then(|i| right_row.get(i).cloned())
                            .unwrap_or(Value::Null);
                        row.push(value);
                    }
                    result.push_row(row);
                }
            }
            None => {
                if how != JoinKind::Inner {
                    result.push_row(left_row.clone());
                }
            }
        }
    }

    // Outer join appends right rows with no left match.
    if how == JoinKind::Outer {
        for (right_idx, right_row) in right.rows.iter().enumerate() {
            if matched_right[right_idx] {
                continue;
            }
            let row: Vec<Value> = result
                .columns
                .iter()
                .map(|col| {
                    right
                        .column_index(col)
                        .and_then(|i| right_row.get(i).cloned())
                        .unwrap_or(Value::Null)
                })
                .collect();
            // Carry the key over even when the key columns are named differently.
            let mut row = row;
            if let (Some(out_idx), Some(rk)) = (result.column_index(left_key), right_key_idx) {
                if row[out_idx].is_null() {
                    row[out_idx] = right_row.get(rk).cloned().unwrap_or(Value::Null);
                }
            }
            result.push_row(row);
        }
    }

    result
}
