//! Table selection strategies.
//!
//! Strategies form a closed tagged union: adding one means adding a variant
//! here and a handler in the extraction engine.

use serde::{Deserialize, Serialize};

fn default_separator() -> String {
    ".".to_string()
}

fn default_var_name() -> String {
    "variable".to_string()
}

fn default_value_name() -> String {
    "value".to_string()
}

fn default_index_var() -> String {
    "i".to_string()
}

/// One side of a join strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinSide {
    /// Path to an array of objects.
    pub path: String,
    /// Key column used for equality matching.
    pub key: String,
}

/// Join flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinKind {
    /// Preserve all left rows, null-fill unmatched right columns.
    Left,
    /// Preserve all right rows, null-fill unmatched left columns.
    Right,
    /// Drop unmatched rows on both sides.
    Inner,
    /// Key-wise union, null-fill whichever side lacks a match.
    Outer,
}

/// A declared extraction strategy with its configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum SelectSpec {
    /// The object at `path` becomes exactly one row.
    FlatObject {
        path: String,
        /// Recursively flatten nested objects into dotted column names.
        #[serde(default)]
        flatten_nested: bool,
        #[serde(default = "default_separator")]
        separator: String,
    },

    /// Zip a header sequence and a parallel sequence-of-sequences into rows.
    HeadersData {
        path: String,
        headers_key: String,
        data_key: String,
        /// Prefix for synthesized positional names when headers are absent.
        #[serde(default)]
        header_fallback: Option<String>,
    },

    /// Each array element becomes one row.
    ArrayOfObjects {
        path: String,
        /// Project exactly these fields; absent means key-union of elements.
        #[serde(default)]
        fields: Option<Vec<String>>,
    },

    /// Wide-to-long reshape.
    Unpivot {
        path: String,
        id_vars: Vec<String>,
        value_vars: Vec<String>,
        #[serde(default = "default_var_name")]
        var_name: String,
        #[serde(default = "default_value_name")]
        value_name: String,
    },

    /// Relational join of two array-of-objects extractions.
    Join {
        left: JoinSide,
        right: JoinSide,
        how: JoinKind,
    },

    /// Iterate an array, substituting the index into the wrapped strategy's
    /// path template and injecting per-element fields into every row.
    RepeatOver {
        iterate_path: String,
        #[serde(default = "default_index_var")]
        index_var: String,
        #[serde(default)]
        inject_fields: Vec<String>,
        base: Box<SelectSpec>,
    },
}

impl SelectSpec {
    /// The strategy tag, as spelled in profiles.
    pub fn tag(&self) -> &'static str {
        match self {
            SelectSpec::FlatObject { .. } => "flat_object",
            SelectSpec::HeadersData { .. } => "headers_data",
            SelectSpec::ArrayOfObjects { .. } => "array_of_objects",
            SelectSpec::Unpivot { .. } => "unpivot",
            SelectSpec::Join { .. } => "join",
            SelectSpec::RepeatOver { .. } => "repeat_over",
        }
    }

    /// All paths referenced by this strategy (and any wrapped base).
    pub fn paths(&self) -> Vec<&str> {
        match self {
            SelectSpec::FlatObject { path, .. }
            | SelectSpec::HeadersData { path, .. }
            | SelectSpec::ArrayOfObjects { path, .. }
            | SelectSpec::Unpivot { path, .. } => vec![path],
            SelectSpec::Join { left, right, .. } => vec![&left.path, &right.path],
            SelectSpec::RepeatOver {
                iterate_path, base, ..
            } => {
                let mut paths = vec![iterate_path.as_str()];
                paths.extend(base.paths());
                paths
            }
        }
    }

    /// Clone with every occurrence of `{var}` in referenced paths replaced
    /// by the iteration index.
    pub fn substitute_index(&self, var: &str, index: usize) -> SelectSpec {
        let token = format!("{{{var}}}");
        let value = index.to_string();
        let sub = |path: &str| path.replace(&token, &value);

        match self {
            SelectSpec::FlatObject {
                path,
                flatten_nested,
                separator,
            } => SelectSpec::FlatObject {
                path: sub(path),
                flatten_nested: *flatten_nested,
                separator: separator.clone(),
            },
            SelectSpec::HeadersData {
                path,
                headers_key,
                data_key,
                header_fallback,
            } => SelectSpec::HeadersData {
                path: sub(path),
                headers_key: headers_key.clone(),
                data_key: data_key.clone(),
                header_fallback: header_fallback.clone(),
            },
            SelectSpec::ArrayOfObjects { path, fields } => SelectSpec::ArrayOfObjects {
                path: sub(path),
                fields: fields.clone(),
            },
            SelectSpec::Unpivot {
                path,
                id_vars,
                value_vars,
                var_name,
                value_name,
            } => SelectSpec::Unpivot {
                path: sub(path),
                id_vars: id_vars.clone(),
                value_vars: value_vars.clone(),
                var_name: var_name.clone(),
                value_name: value_name.clone(),
            },
            SelectSpec::Join { left, right, how } => SelectSpec::Join {
                left: JoinSide {
                    path: sub(&left.path),
                    key: left.key.clone(),
                },
                right: JoinSide {
                    path: sub(&right.path),
                    key: right.key.clone(),
                },
                how: *how,
            },
            SelectSpec::RepeatOver {
                iterate_path,
                index_var,
                inject_fields,
                base,
            } => SelectSpec::RepeatOver {
                iterate_path: sub(iterate_path),
                index_var: index_var.clone(),
                inject_fields: inject_fields.clone(),
                base: Box::new(base.substitute_index(var, index)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_tag_round_trip() {
        let json = r#"{"strategy":"flat_object","path":"summary"}"#;
        let spec: SelectSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.tag(), "flat_object");
    }

    #[test]
    fn test_substitute_index() {
        let spec = SelectSpec::ArrayOfObjects {
            path: "wafers.{i}.sites".to_string(),
            fields: None,
        };
        let sub = spec.substitute_index("i", 3);
        assert_eq!(sub.paths(), vec!["wafers.3.sites"]);
    }

    #[test]
    fn test_repeat_over_paths_include_base() {
        let json = r#"{
            "strategy": "repeat_over",
            "iterate_path": "lots",
            "index_var": "n",
            "base": {"strategy": "flat_object", "path": "lots.{n}.summary"}
        }"#;
        let spec: SelectSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.paths(), vec!["lots", "lots.{n}.summary"]);
    }
}
