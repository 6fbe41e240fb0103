//! Property-based tests for Smelter invariants.
//!
//! These tests use proptest to generate random inputs and verify:
//! 1. **No panics**: parsers and resolvers never crash on any input
//! 2. **Determinism**: same input always produces same output
//! 3. **Invariants**: table shape and identifier properties always hold
//!
//! ```bash
//! cargo test -p smelter --test property_tests
//! PROPTEST_CASES=10000 cargo test -p smelter --test property_tests
//! ```

use indexmap::IndexMap;
use proptest::prelude::*;
use serde_json::{json, Value};

use smelter::stage::{artifact_id, canonical_json};
use smelter::{ContextResolver, ExtractedTable, Resolution, SourceDescriptor};

// =============================================================================
// Test Strategies
// =============================================================================

/// Generate small JSON values, a few levels deep.
fn json_value() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z0-9_]{0,12}".prop_map(Value::String),
    ];
    leaf.prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z_]{1,8}", inner, 0..4)
                .prop_map(|m| json!(m)),
        ]
    })
}

fn file_name() -> impl Strategy<Value = String> {
    "[a-z0-9_]{1,20}\\.(json|csv)"
}

// =============================================================================
// Artifact Identifier Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_artifact_id_deterministic(value in json_value()) {
        prop_assert_eq!(artifact_id(&value), artifact_id(&value));
    }

    #[test]
    fn prop_artifact_id_is_lower_hex_sha256(value in json_value()) {
        let id = artifact_id(&value);
        prop_assert_eq!(id.len(), 64);
        prop_assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn prop_canonical_json_round_trips(value in json_value()) {
        let canonical = canonical_json(&value);
        let reparsed: Value = serde_json::from_str(&canonical).unwrap();
        // Canonical text is a fixed point under re-canonicalization.
        prop_assert_eq!(canonical_json(&reparsed), canonical);
    }

    #[test]
    fn prop_object_key_order_does_not_change_id(
        entries in prop::collection::vec(("[a-z]{1,6}", any::<i32>()), 1..6)
    ) {
        let forward: serde_json::Map<String, Value> = entries
            .iter()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();
        let reversed: serde_json::Map<String, Value> = entries
            .iter()
            .rev()
            .map(|(k, v)| (k.clone(), json!(v)))
            .collect();

        prop_assert_eq!(
            artifact_id(&Value::Object(forward)),
            artifact_id(&Value::Object(reversed))
        );
    }
}

// =============================================================================
// Context Resolution Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_context_resolution_deterministic(
        name in file_name(),
        content in json_value()
    ) {
        let defaults = serde_json::from_value(json!({
            "defaults": {"site": "fab-1"},
            "regex_patterns": [
                {"field": "lot", "pattern": "lot_(\\d+)", "scope": "file_name"}
            ],
            "content_patterns": [
                {"field": "recipe", "path": "meta.recipe"}
            ]
        }))
        .unwrap();
        let descriptor = SourceDescriptor::new(&name);
        let resolver = ContextResolver::new();

        let first = resolver
            .resolve(&defaults, &descriptor, &content, &IndexMap::new())
            .unwrap();
        let second = resolver
            .resolve(&defaults, &descriptor, &content, &IndexMap::new())
            .unwrap();

        let (Resolution::Resolved(a), Resolution::Resolved(b)) = (first, second) else {
            unreachable!("no skip_file rule configured");
        };
        prop_assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}

// =============================================================================
// Table Shape Properties
// =============================================================================

proptest! {
    #[test]
    fn prop_push_row_keeps_rows_homogeneous(
        column_count in 0usize..6,
        cells in prop::collection::vec(any::<i32>(), 0..10)
    ) {
        let columns = (0..column_count).map(|i| format!("c{i}")).collect();
        let mut table = ExtractedTable::new(columns);
        table.push_row(cells.into_iter().map(|n| json!(n)).collect());

        // Short rows pad with null, long rows truncate.
        prop_assert_eq!(table.rows[0].len(), column_count);
    }

    #[test]
    fn prop_union_concat_row_and_column_counts(
        left_rows in 0usize..5,
        right_rows in 0usize..5
    ) {
        let mut left = ExtractedTable::new(vec!["a".into(), "b".into()]);
        for i in 0..left_rows {
            left.push_row(vec![json!(i), json!(i * 2)]);
        }
        let mut right = ExtractedTable::new(vec!["b".into(), "c".into()]);
        for i in 0..right_rows {
            right.push_row(vec![json!(i), json!(i + 1)]);
        }

        left.union_concat(right);
        prop_assert_eq!(left.rows.len(), left_rows + right_rows);
        prop_assert_eq!(left.columns, vec!["a", "b", "c"]);
        for row in &left.rows {
            prop_assert_eq!(row.len(), 3);
        }
    }
}
